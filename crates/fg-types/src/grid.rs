use serde::{Deserialize, Serialize};

use crate::alignment::SpacerIndices;
use crate::phase::DatasetMeta;

/// A single dataset tag, e.g. `["census", "2019", "v2"]`.
pub type DatasetTag = Vec<String>;

/// Dataset tags a participant has declared for each partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTags {
    #[serde(default)]
    pub train: Vec<DatasetTag>,
    #[serde(default)]
    pub evaluate: Vec<DatasetTag>,
    #[serde(default)]
    pub predict: Vec<DatasetTag>,
}

impl MetaTags {
    pub fn get(&self, meta: DatasetMeta) -> &[DatasetTag] {
        match meta {
            DatasetMeta::Train => &self.train,
            DatasetMeta::Evaluate => &self.evaluate,
            DatasetMeta::Predict => &self.predict,
        }
    }

    /// Replace (not extend) the tags of one partition.
    pub fn set(&mut self, meta: DatasetMeta, tags: Vec<DatasetTag>) {
        match meta {
            DatasetMeta::Train => self.train = tags,
            DatasetMeta::Evaluate => self.evaluate = tags,
            DatasetMeta::Predict => self.predict = tags,
        }
    }

    /// Partitions that carry at least one tag.
    pub fn declared_metas(&self) -> Vec<DatasetMeta> {
        DatasetMeta::ALL
            .into_iter()
            .filter(|meta| !self.get(*meta).is_empty())
            .collect()
    }
}

/// Reachability of a worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    /// Port of the federated learning channel.
    pub port: u16,
    /// Port of the worker's REST-RPC service.
    pub f_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Guest,
}

/// Read-only snapshot of one participant inside a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridEntry {
    pub participant_id: String,
    /// Identifier the worker reports for itself; inference references are
    /// keyed by this, not by participant id.
    pub worker_id: String,
    pub address: NodeAddress,
    pub role: ParticipantRole,
    #[serde(default)]
    pub tags: MetaTags,
    #[serde(default)]
    pub alignment: Option<SpacerIndices>,
}

/// The participants usable for one federated cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub entries: Vec<GridEntry>,
}

impl Grid {
    pub fn new(entries: Vec<GridEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GridEntry> {
        self.entries.iter()
    }

    pub fn participants(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.participant_id.clone())
            .collect()
    }

    pub fn find_participant(&self, participant_id: &str) -> Option<&GridEntry> {
        self.entries
            .iter()
            .find(|entry| entry.participant_id == participant_id)
    }

    pub fn find_worker(&self, worker_id: &str) -> Option<&GridEntry> {
        self.entries.iter().find(|entry| entry.worker_id == worker_id)
    }

    /// Copy of this grid with one participant's tags for `meta` replaced.
    pub fn with_tags(&self, participant_id: &str, meta: DatasetMeta, tags: Vec<DatasetTag>) -> Self {
        let mut grid = self.clone();
        if let Some(entry) = grid
            .entries
            .iter_mut()
            .find(|entry| entry.participant_id == participant_id)
        {
            entry.tags.set(meta, tags);
        }
        grid
    }

    /// Copy of this grid carrying the supplied alignments. Participants
    /// missing from `alignments` keep their previous snapshot.
    pub fn with_alignments<'a, I>(&self, alignments: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a SpacerIndices)>,
    {
        let mut grid = self.clone();
        for (participant_id, spacers) in alignments {
            if let Some(entry) = grid
                .entries
                .iter_mut()
                .find(|entry| &entry.participant_id == participant_id)
            {
                entry.alignment = Some(spacers.clone());
            }
        }
        grid
    }
}
