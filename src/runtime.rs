use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde_json::Value;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::BTreeSet;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::logbook::Logbook;

/// Exit status used when a second interrupt forces the process down.
const FORCED_EXIT_CODE: i32 = 130;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn random_hex(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| format!("{:x}", rng.random_range(0..16u8)))
        .collect()
}

pub fn create_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    format!("{stamp}-{}", random_hex(6))
}

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Sends SIGKILL to every process in group `pgid`. Returns false when nothing
/// was signalled.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) -> bool {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    // Groups 0 and 1 would hit ourselves or init.
    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    if raw <= 1 {
        return false;
    }
    killpg(Pid::from_raw(raw), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
pub fn kill_process_group(_pgid: u32) -> bool {
    false
}

/// Shared stop flag plus the process groups of tools currently running.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    groups: Arc<Mutex<BTreeSet<u32>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn track_group(&self, pgid: u32) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pgid);
    }

    pub fn untrack_group(&self, pgid: u32) {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pgid);
    }

    /// Kills every tracked tool process group; returns how many were signalled.
    pub fn kill_tracked_groups(&self) -> usize {
        let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.iter().filter(|&&pgid| kill_process_group(pgid)).count()
    }

    /// First SIGINT/SIGTERM sets the flag. A second one kills the running
    /// tools and exits immediately.
    pub fn install_signal_handlers(&self, log: &Logbook) -> Result<()> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("failed to register signal handlers")?;
        let shutdown = self.clone();
        let log = log.clone();
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    if shutdown.requested() {
                        let killed = shutdown.kill_tracked_groups();
                        log.error(format!(
                            "Second interrupt (signal {signal}); killed {killed} running tools, exiting"
                        ));
                        process::exit(FORCED_EXIT_CODE);
                    }
                    shutdown.request();
                    log.warn(format!(
                        "Interrupt received (signal {signal}); no new jobs will start"
                    ));
                }
            })
            .context("failed to start signal thread")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_has_timestamp_and_hex_suffix() {
        let id = create_run_id();
        let (stamp, suffix) = id.split_once('-').expect("dash");
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shutdown_flag_is_shared_between_clones() {
        let shutdown = Shutdown::new();
        let worker_view = shutdown.clone();
        assert!(!worker_view.requested());
        shutdown.request();
        assert!(worker_view.requested());
    }

    #[test]
    fn refuses_to_signal_own_or_init_group() {
        assert!(!kill_process_group(0));
        assert!(!kill_process_group(1));
        assert!(!kill_process_group(u32::MAX));
    }

    #[cfg(unix)]
    #[test]
    fn tracked_groups_are_killed_with_their_children() {
        use std::os::unix::process::{CommandExt, ExitStatusExt};
        use std::process::Command;

        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .expect("spawn sh");
        let shutdown = Shutdown::new();
        shutdown.track_group(child.id());
        shutdown.track_group(999_999);
        shutdown.untrack_group(999_999);

        assert_eq!(shutdown.kill_tracked_groups(), 1);
        let status = child.wait().expect("wait");
        assert_eq!(status.signal(), Some(9));
    }
}
