//! Multiple feature alignment.
//!
//! Participants hold vertically similar but not identical datasets. The
//! superset of every reported column gives the model's input (and output)
//! space; each participant pads the columns it lacks at the spacer indices.

use std::collections::{BTreeMap, BTreeSet};

use fg_types::{Action, AxisIndices, DatasetHeaders, DatasetMeta, SpacerIndices};

/// Sorted union of every participant's headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSuperset {
    pub x: Vec<String>,
    pub y: Vec<String>,
}

impl FeatureSuperset {
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = &'a DatasetHeaders>,
    {
        let mut x = BTreeSet::new();
        let mut y = BTreeSet::new();
        for dataset in headers {
            for meta in DatasetMeta::ALL {
                let meta_headers = dataset.get(meta);
                x.extend(meta_headers.x.iter().cloned());
                y.extend(meta_headers.y.iter().cloned());
            }
        }
        Self {
            x: x.into_iter().collect(),
            y: y.into_iter().collect(),
        }
    }

    /// Spacer indices of one participant. A partition without headers has
    /// nothing to pad.
    pub fn spacers_for(&self, headers: &DatasetHeaders) -> SpacerIndices {
        let mut spacers = SpacerIndices::default();
        for meta in DatasetMeta::ALL {
            let meta_headers = headers.get(meta);
            if meta_headers.x.is_empty() && meta_headers.y.is_empty() {
                continue;
            }
            spacers.set(
                meta,
                AxisIndices {
                    x: missing_positions(&self.x, &meta_headers.x),
                    y: missing_positions(&self.y, &meta_headers.y),
                },
            );
        }
        spacers
    }

    pub fn align_all(
        &self,
        headers: &BTreeMap<String, DatasetHeaders>,
    ) -> BTreeMap<String, SpacerIndices> {
        headers
            .iter()
            .map(|(participant_id, dataset)| (participant_id.clone(), self.spacers_for(dataset)))
            .collect()
    }

    pub fn input_size(&self) -> u64 {
        self.x.len() as u64
    }

    /// Output layer width. Binary classification uses a single logit.
    pub fn output_size(&self, action: Action) -> u64 {
        match (action, self.y.len()) {
            (Action::Classify, 2) => 1,
            (_, size) => size as u64,
        }
    }
}

fn missing_positions(superset: &[String], present: &[String]) -> Vec<usize> {
    let present: BTreeSet<&str> = present.iter().map(String::as_str).collect();
    superset
        .iter()
        .enumerate()
        .filter(|(_, header)| !present.contains(header.as_str()))
        .map(|(index, _)| index)
        .collect()
}
