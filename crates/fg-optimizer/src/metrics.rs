//! Reduction of per-participant validation statistics to one objective.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use fg_types::{
    validation_error, DatasetMeta, FgError, FgResult, OptimizationError, StatisticsRecord,
};
use serde::{Deserialize, Serialize};

/// Statistics a search can optimise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchMetric {
    Accuracy,
    RocAuc,
    PrAuc,
    FScore,
    R2,
    Mse,
    Mae,
}

impl SearchMetric {
    pub const ALL: [SearchMetric; 7] = [
        Self::Accuracy,
        Self::RocAuc,
        Self::PrAuc,
        Self::FScore,
        Self::R2,
        Self::Mse,
        Self::Mae,
    ];

    /// Name the statistic is reported under.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::RocAuc => "roc_auc_score",
            Self::PrAuc => "pr_auc_score",
            Self::FScore => "f_score",
            Self::R2 => "R2",
            Self::Mse => "MSE",
            Self::Mae => "MAE",
        }
    }

    /// Classification metrics are reported per class.
    pub fn is_classification(&self) -> bool {
        matches!(self, Self::Accuracy | Self::RocAuc | Self::PrAuc | Self::FScore)
    }
}

impl fmt::Display for SearchMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMetric {
    type Err = FgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                OptimizationError::UnsupportedMetric {
                    metric: s.to_string(),
                }
                .into()
            })
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_nan() || value < 0.0 {
        0.0
    } else {
        value
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, count) = values
        .into_iter()
        .map(non_negative)
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Mean of `metric` across participants' evaluation statistics.
///
/// Negative and NaN values count as zero. Each participant's measurements
/// are averaged first, then the participant means are averaged.
pub fn aggregate_metric(
    metric: SearchMetric,
    records: &BTreeMap<String, StatisticsRecord>,
) -> FgResult<f64> {
    let mut participant_means = Vec::with_capacity(records.len());
    for (participant_id, record) in records {
        let values = record
            .statistics
            .get(&DatasetMeta::Evaluate)
            .and_then(|stats| stats.statistics.get(metric.as_str()))
            .ok_or_else(|| {
                validation_error!(
                    "participant '{}' reported no '{}' for {}",
                    participant_id,
                    metric,
                    record.key.combination
                )
            })?
            .values();
        participant_means.push(mean(values));
    }
    Ok(mean(participant_means))
}

/// Every search metric all participants reported, aggregated.
pub fn summarise(records: &BTreeMap<String, StatisticsRecord>) -> BTreeMap<String, f64> {
    SearchMetric::ALL
        .into_iter()
        .filter_map(|metric| {
            aggregate_metric(metric, records)
                .ok()
                .map(|value| (metric.as_str().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fg_types::{CombinationKey, InferenceKind, InferenceStatistics, MetaStatistics, StatValue};

    fn record(participant: &str, stats: Vec<(&str, StatValue)>) -> (String, StatisticsRecord) {
        let key = CombinationKey::new("collab", "project", "expt", "optim_run_1").worker(participant);
        let mut evaluate = InferenceStatistics::default();
        for (name, value) in stats {
            evaluate.statistics.insert(name.to_string(), value);
        }
        let mut per_meta = MetaStatistics::new();
        per_meta.insert(DatasetMeta::Evaluate, evaluate);
        (
            participant.to_string(),
            StatisticsRecord::new(key, InferenceKind::Validation, per_meta),
        )
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!("accuracy".parse::<SearchMetric>().unwrap(), SearchMetric::Accuracy);
        assert_eq!("r2".parse::<SearchMetric>().unwrap(), SearchMetric::R2);
        assert_eq!("roc_auc_score".parse::<SearchMetric>().unwrap(), SearchMetric::RocAuc);
        assert!(matches!(
            "sharpe_ratio".parse::<SearchMetric>().unwrap_err(),
            FgError::Optimization(OptimizationError::UnsupportedMetric { .. })
        ));
    }

    #[test]
    fn nan_and_negative_values_count_as_zero() {
        let records: BTreeMap<_, _> = [
            record("alice", vec![("accuracy", StatValue::Series(vec![0.8, 0.6]))]),
            record("bob", vec![("accuracy", StatValue::Series(vec![f64::NAN, 0.5]))]),
            record("carol", vec![("accuracy", StatValue::Series(vec![-1.0, -0.5]))]),
        ]
        .into_iter()
        .collect();

        // (0.7 + 0.25 + 0.0) / 3
        let value = aggregate_metric(SearchMetric::Accuracy, &records).unwrap();
        assert!((value - 0.95 / 3.0).abs() < 1e-9, "got {value}");
    }

    #[test]
    fn regression_scalars_average_across_participants() {
        let records: BTreeMap<_, _> = [
            record("alice", vec![("R2", StatValue::Scalar(0.9))]),
            record("bob", vec![("R2", StatValue::Scalar(-0.3))]),
        ]
        .into_iter()
        .collect();
        let value = aggregate_metric(SearchMetric::R2, &records).unwrap();
        assert!((value - 0.45).abs() < 1e-9);
    }

    #[test]
    fn missing_metric_names_the_participant() {
        let records: BTreeMap<_, _> =
            [record("alice", vec![("MSE", StatValue::Scalar(0.1))])].into_iter().collect();
        let error = aggregate_metric(SearchMetric::Accuracy, &records).unwrap_err();
        assert!(error.to_string().contains("alice"));
    }

    #[test]
    fn summary_keeps_metrics_every_participant_reported() {
        let records: BTreeMap<_, _> = [
            record(
                "alice",
                vec![
                    ("accuracy", StatValue::Series(vec![1.0])),
                    ("f_score", StatValue::Series(vec![0.5])),
                ],
            ),
            record("bob", vec![("accuracy", StatValue::Series(vec![0.5]))]),
        ]
        .into_iter()
        .collect();

        let summary = summarise(&records);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary["accuracy"], 0.75);
    }
}
