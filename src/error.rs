use std::io;
use std::path::PathBuf;

/// Errors that abort the whole run before any job is dispatched.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("cannot access {role} directory {}: {source}", path.display())]
    DirectoryAccess {
        role: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "input files {} and {} both map to job '{name}'; rename one of them",
        first.display(),
        second.display()
    )]
    BaseNameCollision {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

impl OrchestratorError {
    pub fn directory(role: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::DirectoryAccess {
            role,
            path: path.into(),
            source,
        }
    }
}

/// Failures contained to a single job.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("tool exited with {status}")]
    ToolExit { status: String },
    #[error("tool exited successfully but {} was not produced", artifact.display())]
    MissingArtifact { artifact: PathBuf },
    #[error("terminated by shutdown request")]
    Interrupted,
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl JobError {
    pub fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Launch { .. } | Self::ToolExit { .. } | Self::MissingArtifact { .. } => "tool",
            Self::Interrupted => "interrupted",
            Self::Unexpected(_) => "unexpected",
        }
    }
}
