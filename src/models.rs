use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::JobError;

pub const RESULT_DIR_PREFIX: &str = "Result_";
pub const LOCK_MARKER_NAME: &str = ".lock";

/// What the filesystem says about a job's result directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Unstarted,
    Partial,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Unstarted,
    Partial,
    Locked,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Partial => "partial",
            Self::Locked => "locked",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl From<ArtifactState> for JobState {
    fn from(state: ArtifactState) -> Self {
        match state {
            ArtifactState::Unstarted => Self::Unstarted,
            ArtifactState::Partial => Self::Partial,
            ArtifactState::Completed => Self::Completed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub input_path: PathBuf,
    pub result_dir: PathBuf,
    pub state: JobState,
}

impl Job {
    pub fn new(id: String, input_path: PathBuf, output_root: &Path) -> Self {
        let result_dir = result_dir_for(output_root, &id);
        Self {
            id,
            input_path,
            result_dir,
            state: JobState::Unstarted,
        }
    }
}

pub fn result_dir_for(output_root: &Path, job_id: &str) -> PathBuf {
    output_root.join(format!("{RESULT_DIR_PREFIX}{job_id}"))
}

pub fn job_id_from_dir_name(name: &str) -> Option<&str> {
    name.strip_prefix(RESULT_DIR_PREFIX)
        .filter(|rest| !rest.is_empty())
}

#[derive(Debug)]
pub enum JobOutcome {
    Succeeded,
    Failed(JobError),
    AlreadyComplete,
    Contended { owner_pid: Option<u32> },
    NotStarted,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed(_) => "failed",
            Self::AlreadyComplete => "already_complete",
            Self::Contended { .. } => "contended",
            Self::NotStarted => "not_started",
        }
    }

    pub fn final_state(&self) -> JobState {
        match self {
            Self::Succeeded | Self::AlreadyComplete => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
            Self::Contended { .. } => JobState::Locked,
            Self::NotStarted => JobState::Unstarted,
        }
    }
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}
