use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::config::Layout;
use crate::error::OrchestratorError;
use crate::lock::{LockManager, LockStatus};
use crate::logbook::{Level, Logbook};
use crate::models::{ArtifactState, Job, JobState, job_id_from_dir_name};
use crate::sentinel::Sentinel;

/// Initial state of every job, derived from the filesystem.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub queue: Vec<Job>,
    pub already_complete: Vec<Job>,
    pub removed: Vec<PathBuf>,
}

pub struct Reconciler<'a> {
    pub layout: &'a Layout,
    pub sentinel: &'a Sentinel,
    pub locks: &'a LockManager,
    pub log: &'a Logbook,
}

impl Reconciler<'_> {
    /// Classifies every job, deletes stale partial directories and returns
    /// the jobs that still need to run.
    pub fn reconcile(&self) -> Result<Reconciliation, OrchestratorError> {
        let output_dir = &self.layout.output_dir;
        fs::create_dir_all(output_dir)
            .map_err(|source| OrchestratorError::directory("output", output_dir, source))?;

        let jobs = self.discover_jobs()?;
        let known: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        let mut completed = HashSet::new();
        let mut live_locked = HashSet::new();
        let mut removed = vec![];

        for (id, dir) in scan_result_dirs(output_dir)? {
            let orphan = !known.contains(id.as_str());
            match self.sentinel.classify(&dir) {
                ArtifactState::Completed => {
                    completed.insert(id);
                }
                ArtifactState::Partial => match self.locks.inspect(&dir) {
                    LockStatus::Live { owner } => {
                        let holder = owner
                            .map(|o| format!("pid {}", o.pid))
                            .unwrap_or_else(|| "an unknown owner".to_string());
                        self.log.job(
                            Level::Warn,
                            &id,
                            format!(
                                "partial result directory {} is locked by {holder}; leaving it in place",
                                dir.display()
                            ),
                        );
                        live_locked.insert(id);
                    }
                    status => {
                        if let LockStatus::Stale { reason, .. } = &status {
                            self.log
                                .job(Level::Warn, &id, format!("ignoring stale lock: {reason}"));
                        }
                        if self.remove_partial(&id, &dir, orphan) {
                            removed.push(dir);
                        }
                    }
                },
                ArtifactState::Unstarted => {}
            }
        }

        let mut out = Reconciliation {
            removed,
            ..Reconciliation::default()
        };
        for mut job in jobs {
            if completed.contains(&job.id) {
                job.state = JobState::Completed;
                self.log.job(
                    Level::Info,
                    &job.id,
                    format!(
                        "already processed ({} exists); skipping",
                        self.sentinel.artifact().display()
                    ),
                );
                out.already_complete.push(job);
            } else {
                if live_locked.contains(&job.id) {
                    job.state = JobState::Locked;
                }
                out.queue.push(job);
            }
        }

        self.log.info(format!(
            "Found {} input files: {} already complete, {} to process, {} partial directories removed",
            out.queue.len() + out.already_complete.len(),
            out.already_complete.len(),
            out.queue.len(),
            out.removed.len()
        ));
        Ok(out)
    }

    /// Read-only classification of every input file.
    pub fn survey(&self) -> Result<Vec<Job>, OrchestratorError> {
        let mut jobs = self.discover_jobs()?;
        match fs::metadata(&self.layout.output_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(OrchestratorError::directory(
                    "output",
                    &self.layout.output_dir,
                    std::io::Error::new(ErrorKind::NotADirectory, "not a directory"),
                ));
            }
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(jobs),
            Err(source) => {
                return Err(OrchestratorError::directory(
                    "output",
                    &self.layout.output_dir,
                    source,
                ));
            }
        }

        for job in &mut jobs {
            job.state = match self.sentinel.classify(&job.result_dir) {
                ArtifactState::Partial
                    if matches!(self.locks.inspect(&job.result_dir), LockStatus::Live { .. }) =>
                {
                    JobState::Locked
                }
                state => state.into(),
            };
        }
        Ok(jobs)
    }

    fn discover_jobs(&self) -> Result<Vec<Job>, OrchestratorError> {
        let inputs = discover_inputs(&self.layout.input_dir, &self.layout.extensions)?;
        let mut by_id: BTreeMap<String, PathBuf> = BTreeMap::new();
        for path in inputs {
            let Some(id) = job_id_for(&path) else {
                self.log.warn(format!(
                    "skipping {}: file name is not valid UTF-8",
                    path.display()
                ));
                continue;
            };
            if let Some(first) = by_id.get(&id) {
                return Err(OrchestratorError::BaseNameCollision {
                    name: id,
                    first: first.clone(),
                    second: path,
                });
            }
            by_id.insert(id, path);
        }
        Ok(by_id
            .into_iter()
            .map(|(id, path)| Job::new(id, path, &self.layout.output_dir))
            .collect())
    }

    fn remove_partial(&self, id: &str, dir: &Path, orphan: bool) -> bool {
        let what = if orphan {
            "partial result directory without a matching input"
        } else {
            "partially processed directory"
        };
        match fs::remove_dir_all(dir) {
            Ok(()) => {
                self.log
                    .job(Level::Info, id, format!("removed {what} {}", dir.display()));
                true
            }
            Err(err) => {
                // The job is still scheduled; the executor reuses the directory.
                self.log.job(
                    Level::Error,
                    id,
                    format!("failed to remove {what} {}: {err}", dir.display()),
                );
                false
            }
        }
    }
}

/// Regular files in `input_dir` whose extension is allow-listed, sorted by name.
pub fn discover_inputs(
    input_dir: &Path,
    extensions: &[String],
) -> Result<Vec<PathBuf>, OrchestratorError> {
    let root = fs::canonicalize(input_dir)
        .map_err(|source| OrchestratorError::directory("input", input_dir, source))?;
    let entries = fs::read_dir(&root)
        .map_err(|source| OrchestratorError::directory("input", &root, source))?;

    let mut out = vec![];
    for entry in entries {
        let entry = entry.map_err(|source| OrchestratorError::directory("input", &root, source))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.iter().any(|allowed| e.eq_ignore_ascii_case(allowed)))
            .unwrap_or(false);
        if matches {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// The job id is the file stem, unchanged, so `Result_<stem>` matches
/// directories written by earlier runs.
pub fn job_id_for(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem == "." || stem == ".." {
        None
    } else {
        Some(stem.to_string())
    }
}

fn scan_result_dirs(output_dir: &Path) -> Result<Vec<(String, PathBuf)>, OrchestratorError> {
    let entries = fs::read_dir(output_dir)
        .map_err(|source| OrchestratorError::directory("output", output_dir, source))?;
    let mut out = vec![];
    for entry in entries {
        let entry =
            entry.map_err(|source| OrchestratorError::directory("output", output_dir, source))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(id) = job_id_from_dir_name(&name) {
            out.push((id.to_string(), entry.path()));
        }
    }
    out.sort();
    Ok(out)
}
