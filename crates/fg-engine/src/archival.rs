//! Persisting job outputs.
//!
//! Outputs are written only after the whole job has succeeded, so a failed
//! or rejected job never leaves partial records behind.

use fg_align::commit_plan;
use fg_archive::Archive;
use fg_types::{
    validation_error, CombinationKey, FgResult, InferenceKind, JobKey, ParticipantStatistics,
    StatisticsRecord,
};
use tracing::debug;

use crate::runner::JobOutput;

/// Write everything a completed job produced.
pub fn archive_output(archive: &dyn Archive, key: &JobKey, output: &JobOutput) -> FgResult<()> {
    match output {
        JobOutput::Alignment(plan) => commit_plan(archive, plan),
        JobOutput::Training(model) => archive.write_model(model.clone()),
        JobOutput::Validation(statistics) => write_statistics(
            archive,
            combination(key)?,
            InferenceKind::Validation,
            statistics,
        ),
        JobOutput::Prediction {
            participant_id,
            tags,
            alignment,
            statistics,
        } => {
            let key = combination(key)?;
            archive.write_tags(&key.project(), participant_id, tags.clone())?;
            commit_plan(archive, alignment)?;
            write_statistics(archive, key, InferenceKind::Prediction, statistics)
        }
        JobOutput::Optimization {
            run,
            model,
            validation,
        } => {
            archive.write_run(run.clone())?;
            archive.write_model(model.clone())?;
            write_statistics(
                archive,
                combination(key)?,
                InferenceKind::Validation,
                validation,
            )
        }
    }
}

fn combination(key: &JobKey) -> FgResult<&CombinationKey> {
    key.combination()
        .ok_or_else(|| validation_error!("statistics require a combination key, got {}", key))
}

fn write_statistics(
    archive: &dyn Archive,
    key: &CombinationKey,
    kind: InferenceKind,
    statistics: &ParticipantStatistics,
) -> FgResult<()> {
    for (participant_id, per_meta) in statistics {
        archive.write_statistics(StatisticsRecord::new(
            key.worker(participant_id.clone()),
            kind,
            per_meta.clone(),
        ))?;
    }
    debug!(
        expt_id = %key.expt_id,
        run_id = %key.run_id,
        participants = statistics.len(),
        "Archived {:?} statistics",
        kind
    );
    Ok(())
}
