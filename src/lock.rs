use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use crate::error::JobError;
use crate::models::LOCK_MARKER_NAME;
use crate::runtime::{now_iso, random_hex};

static LEGACY_MARKER_RE: OnceLock<Regex> = OnceLock::new();

/// Contents of a lock marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub acquired_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Live { owner: Option<LockOwner> },
    Stale { owner: Option<LockOwner>, reason: String },
}

impl LockStatus {
    pub fn owner_pid(&self) -> Option<u32> {
        match self {
            Self::Free => None,
            Self::Live { owner } | Self::Stale { owner, .. } => owner.as_ref().map(|o| o.pid),
        }
    }
}

#[derive(Debug)]
pub enum Acquire {
    Acquired(LockGuard),
    Contended(LockStatus),
}

/// Per-job mutual exclusion through a create-exclusive marker file.
///
/// A marker is considered stale when its owner process is gone or when it is
/// older than `stale_after`. Stale markers are never taken over here; the
/// reconciler removes them together with the partial result directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    run_id: String,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(run_id: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            run_id: run_id.into(),
            stale_after,
        }
    }

    pub fn try_acquire(&self, result_dir: &Path) -> Result<Acquire, JobError> {
        let path = result_dir.join(LOCK_MARKER_NAME);
        let owner = LockOwner {
            pid: std::process::id(),
            token: new_token(),
            run_id: Some(self.run_id.clone()),
            acquired_at: Some(now_iso()),
        };
        let body = serde_json::to_string(&owner)
            .map_err(|err| JobError::Unexpected(format!("failed to encode lock marker: {err}")))?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Ok(Acquire::Contended(self.inspect(result_dir)));
            }
            Err(source) => return Err(JobError::io("failed to create lock marker", path, source)),
        };
        if let Err(source) = file
            .write_all(body.as_bytes())
            .and_then(|()| file.sync_all())
        {
            let _ = fs::remove_file(&path);
            return Err(JobError::io("failed to write lock marker", path, source));
        }

        Ok(Acquire::Acquired(LockGuard {
            path,
            token: owner.token,
            released: false,
        }))
    }

    pub fn inspect(&self, result_dir: &Path) -> LockStatus {
        let path = result_dir.join(LOCK_MARKER_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return LockStatus::Free,
            // Unreadable markers are treated as held.
            Err(_) => return LockStatus::Live { owner: None },
        };
        let owner = parse_owner(&text);
        let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
        match self.staleness(owner.as_ref(), modified) {
            Some(reason) => LockStatus::Stale { owner, reason },
            None => LockStatus::Live { owner },
        }
    }

    fn staleness(&self, owner: Option<&LockOwner>, modified: Option<SystemTime>) -> Option<String> {
        if let Some(owner) = owner
            && !pid_alive(owner.pid)
        {
            return Some(format!("owner pid {} is no longer running", owner.pid));
        }

        let age = owner
            .and_then(|o| o.acquired_at.as_deref())
            .and_then(age_from_timestamp)
            .or_else(|| modified.and_then(|m| m.elapsed().ok()));
        match age {
            Some(age) if age > self.stale_after => Some(format!(
                "marker is {}s old (limit {}s)",
                age.as_secs(),
                self.stale_after.as_secs()
            )),
            _ => None,
        }
    }
}

/// Holds a lock marker; the marker is removed on `release` or on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), JobError> {
        self.released = true;
        remove_owned_marker(&self.path, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = remove_owned_marker(&self.path, &self.token);
        }
    }
}

fn remove_owned_marker(path: &Path, token: &str) -> Result<(), JobError> {
    match fs::read_to_string(path) {
        Ok(text) => {
            if parse_owner(&text).is_some_and(|owner| owner.token != token) {
                return Ok(());
            }
        }
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(JobError::io("failed to read lock marker", path, source)),
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(JobError::io("failed to remove lock marker", path, source)),
    }
}

pub fn parse_owner(text: &str) -> Option<LockOwner> {
    if let Ok(owner) = serde_json::from_str::<LockOwner>(text.trim()) {
        return Some(owner);
    }
    let re = LEGACY_MARKER_RE
        .get_or_init(|| Regex::new(r"Locked by PID (\d+)").expect("valid regex"));
    let pid = re.captures(text)?.get(1)?.as_str().parse().ok()?;
    Some(LockOwner {
        pid,
        token: String::new(),
        run_id: None,
        acquired_at: None,
    })
}

fn new_token() -> String {
    format!("{}-{}", std::process::id(), random_hex(12))
}

fn age_from_timestamp(stamp: &str) -> Option<Duration> {
    let at = DateTime::parse_from_rfc3339(stamp).ok()?;
    (Utc::now() - at.with_timezone(&Utc)).to_std().ok()
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Non-positive pids address process groups, never a single owner.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Alive, but owned by another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Without a liveness probe only the age limit applies.
    true
}
