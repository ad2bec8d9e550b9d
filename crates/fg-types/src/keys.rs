use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Addresses a project within a collaboration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub collab_id: String,
    pub project_id: String,
}

impl ProjectKey {
    pub fn new(collab_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            collab_id: collab_id.into(),
            project_id: project_id.into(),
        }
    }

    pub fn experiment(&self, expt_id: impl Into<String>) -> ExperimentKey {
        ExperimentKey {
            collab_id: self.collab_id.clone(),
            project_id: self.project_id.clone(),
            expt_id: expt_id.into(),
        }
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Collaboration '{}' > Project '{}'",
            self.collab_id, self.project_id
        )
    }
}

/// Addresses an experiment (model architecture) under a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExperimentKey {
    pub collab_id: String,
    pub project_id: String,
    pub expt_id: String,
}

impl ExperimentKey {
    pub fn new(
        collab_id: impl Into<String>,
        project_id: impl Into<String>,
        expt_id: impl Into<String>,
    ) -> Self {
        Self {
            collab_id: collab_id.into(),
            project_id: project_id.into(),
            expt_id: expt_id.into(),
        }
    }

    pub fn project(&self) -> ProjectKey {
        ProjectKey::new(self.collab_id.clone(), self.project_id.clone())
    }

    pub fn run(&self, run_id: impl Into<String>) -> CombinationKey {
        CombinationKey {
            collab_id: self.collab_id.clone(),
            project_id: self.project_id.clone(),
            expt_id: self.expt_id.clone(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > Experiment '{}'", self.project(), self.expt_id)
    }
}

/// One addressable unit of federated work.
///
/// Used both as the archival key and as the correlation key of queue
/// messages. Never mutated once generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CombinationKey {
    pub collab_id: String,
    pub project_id: String,
    pub expt_id: String,
    pub run_id: String,
}

impl CombinationKey {
    pub fn new(
        collab_id: impl Into<String>,
        project_id: impl Into<String>,
        expt_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            collab_id: collab_id.into(),
            project_id: project_id.into(),
            expt_id: expt_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn project(&self) -> ProjectKey {
        ProjectKey::new(self.collab_id.clone(), self.project_id.clone())
    }

    pub fn experiment(&self) -> ExperimentKey {
        ExperimentKey::new(
            self.collab_id.clone(),
            self.project_id.clone(),
            self.expt_id.clone(),
        )
    }

    /// Scope this combination to a single participant.
    pub fn worker(&self, participant_id: impl Into<String>) -> WorkerKey {
        WorkerKey {
            participant_id: participant_id.into(),
            combination: self.clone(),
        }
    }

    pub fn segments(&self) -> [&str; 4] {
        [
            self.collab_id.as_str(),
            self.project_id.as_str(),
            self.expt_id.as_str(),
            self.run_id.as_str(),
        ]
    }

    /// Directory under `root` holding this combination's result artifacts.
    pub fn result_dir(&self, root: &Path) -> PathBuf {
        self.segments()
            .iter()
            .fold(root.to_path_buf(), |path, segment| path.join(segment))
    }
}

impl fmt::Display for CombinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > Run '{}'", self.experiment(), self.run_id)
    }
}

/// A combination as seen from one participant's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerKey {
    pub participant_id: String,
    pub combination: CombinationKey,
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Participant '{}' >|< {}",
            self.participant_id, self.combination
        )
    }
}

/// Key carried by a dispatched job: alignment works at project scope, every
/// other phase works on a full combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobKey {
    // Listed first so untagged deserialization prefers the wider shape.
    Combination(CombinationKey),
    Project(ProjectKey),
}

impl JobKey {
    pub fn project(&self) -> ProjectKey {
        match self {
            Self::Combination(key) => key.project(),
            Self::Project(key) => key.clone(),
        }
    }

    pub fn collab_id(&self) -> &str {
        match self {
            Self::Combination(key) => &key.collab_id,
            Self::Project(key) => &key.collab_id,
        }
    }

    pub fn combination(&self) -> Option<&CombinationKey> {
        match self {
            Self::Combination(key) => Some(key),
            Self::Project(_) => None,
        }
    }
}

impl From<CombinationKey> for JobKey {
    fn from(key: CombinationKey) -> Self {
        Self::Combination(key)
    }
}

impl From<ProjectKey> for JobKey {
    fn from(key: ProjectKey) -> Self {
        Self::Project(key)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Combination(key) => key.fmt(f),
            Self::Project(key) => key.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combination_key_derives_parents() {
        let key = CombinationKey::new("c1", "p1", "e1", "r1");
        assert_eq!(key.project(), ProjectKey::new("c1", "p1"));
        assert_eq!(key.experiment(), ExperimentKey::new("c1", "p1", "e1"));
        assert_eq!(key.experiment().run("r1"), key);
        assert_eq!(key.segments(), ["c1", "p1", "e1", "r1"]);
        assert_eq!(
            key.result_dir(Path::new("/out")),
            PathBuf::from("/out/c1/p1/e1/r1")
        );
    }

    #[test]
    fn display_names_every_level() {
        let key = CombinationKey::new("c1", "p1", "e1", "r1");
        let rendered = key.worker("alice").to_string();
        assert!(rendered.contains("Participant 'alice'"));
        assert!(rendered.contains("Project 'p1'"));
        assert!(rendered.contains("Run 'r1'"));
    }

    #[test]
    fn job_key_untagged_prefers_combination() {
        let combination: JobKey = CombinationKey::new("c", "p", "e", "r").into();
        let json = serde_json::to_string(&combination).unwrap();
        let back: JobKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, combination);

        let project: JobKey = ProjectKey::new("c", "p").into();
        let json = serde_json::to_string(&project).unwrap();
        let back: JobKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, project);
        assert!(back.combination().is_none());
        assert_eq!(back.collab_id(), "c");
    }
}
