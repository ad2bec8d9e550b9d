use std::collections::BTreeMap;

use fg_types::{
    Action, DatasetHeaders, DatasetMeta, InferenceRefs, InferenceStatistics, MetaStatistics,
    MetaTags, SpacerIndices,
};
use serde::{Deserialize, Serialize};

/// Body of a header poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadersRequest {
    pub action: Action,
    pub tags: MetaTags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadersResponse {
    pub headers: DatasetHeaders,
}

/// Body of an inference call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub action: Action,
    pub tags: MetaTags,
    pub alignments: SpacerIndices,
    pub inferences: InferenceRefs,
}

/// Worker inference reply, keyed by rendered combination then partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub results: BTreeMap<String, BTreeMap<String, InferenceStatistics>>,
}

impl InferenceResponse {
    /// Statistics of one experiment/run, restricted to `metas`. Partitions
    /// the worker reports but nobody asked for are dropped.
    pub fn extract(&self, expt_id: &str, run_id: &str, metas: &[DatasetMeta]) -> Option<MetaStatistics> {
        let per_meta = self.results.get(&combination_result_key(expt_id, run_id))?;
        Some(
            metas
                .iter()
                .filter_map(|meta| {
                    per_meta
                        .get(meta.as_str())
                        .map(|stats| (*meta, stats.clone()))
                })
                .collect(),
        )
    }
}

/// Key workers use for an experiment/run pair in inference replies.
pub fn combination_result_key(expt_id: &str, run_id: &str) -> String {
    format!("('{}', '{}')", expt_id, run_id)
}
