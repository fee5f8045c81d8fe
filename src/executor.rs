use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{InterruptPolicy, ToolSpec};
use crate::error::JobError;
use crate::lock::{Acquire, LockManager, LockStatus};
use crate::logbook::{Level, Logbook};
use crate::models::{ArtifactState, Job, JobOutcome, JobState};
use crate::pool::JobRunner;
use crate::runtime::{Shutdown, kill_process_group};
use crate::sentinel::Sentinel;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const READER_GRACE: Duration = Duration::from_secs(2);

/// Runs one job: lock, launch the tool, stream its output, classify, unlock.
pub struct Executor {
    sentinel: Sentinel,
    locks: LockManager,
    tool: ToolSpec,
    log: Logbook,
    shutdown: Shutdown,
    on_interrupt: InterruptPolicy,
}

impl JobRunner for Executor {
    fn execute(&self, job: Job) -> JobOutcome {
        self.run(job)
    }
}

impl Executor {
    pub fn new(
        sentinel: Sentinel,
        locks: LockManager,
        tool: ToolSpec,
        log: Logbook,
        shutdown: Shutdown,
        on_interrupt: InterruptPolicy,
    ) -> Self {
        Self {
            sentinel,
            locks,
            tool,
            log,
            shutdown,
            on_interrupt,
        }
    }

    pub fn run(&self, mut job: Job) -> JobOutcome {
        if self.sentinel.classify(&job.result_dir) == ArtifactState::Completed {
            self.log.job(
                Level::Info,
                &job.id,
                "completed elsewhere since reconciliation; skipping",
            );
            return JobOutcome::AlreadyComplete;
        }

        // The marker lives inside the result directory, so it must exist first.
        if let Err(source) = fs::create_dir_all(&job.result_dir) {
            return self.fail(
                &job,
                JobError::io("failed to create result directory", &job.result_dir, source),
            );
        }

        let guard = match self.locks.try_acquire(&job.result_dir) {
            Ok(Acquire::Acquired(guard)) => guard,
            Ok(Acquire::Contended(status)) => {
                let detail = match &status {
                    LockStatus::Stale { reason, .. } => {
                        format!("stale lock ({reason}); it will be cleared by the next run")
                    }
                    _ => match status.owner_pid() {
                        Some(pid) => format!("held by pid {pid}"),
                        None => "held by another owner".to_string(),
                    },
                };
                self.log
                    .job(Level::Info, &job.id, format!("skipping, lock {detail}"));
                return JobOutcome::Contended {
                    owner_pid: status.owner_pid(),
                };
            }
            Err(err) => return self.fail(&job, err),
        };

        self.log.job(
            Level::Debug,
            &job.id,
            format!("acquired lock {}", guard.path().display()),
        );
        job.state = JobState::Running;
        self.log.job(
            Level::Info,
            &job.id,
            format!("starting processing of {}", job.input_path.display()),
        );
        let outcome = match self.invoke(&job) {
            Ok(()) => {
                self.log
                    .job(Level::Info, &job.id, "successfully processed");
                JobOutcome::Succeeded
            }
            Err(err) => self.fail(&job, err),
        };
        job.state = outcome.final_state();

        match guard.release() {
            Ok(()) => self.log.job(
                Level::Debug,
                &job.id,
                format!("lock released; final state {}", job.state.label()),
            ),
            Err(err) => {
                self.log
                    .job(Level::Warn, &job.id, format!("failed to release lock: {err}"))
            }
        }
        outcome
    }

    fn fail(&self, job: &Job, err: JobError) -> JobOutcome {
        self.log.job(
            Level::Error,
            &job.id,
            format!("failed ({}): {err}", err.kind()),
        );
        JobOutcome::Failed(err)
    }

    fn invoke(&self, job: &Job) -> Result<(), JobError> {
        let args = self.tool.render_args(job);
        self.log.job(
            Level::Info,
            &job.id,
            format!("executing: {} {}", self.tool.program, args.join(" ")),
        );

        let mut command = Command::new(&self.tool.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Keep terminal interrupts away from the tool; shutdown policy decides its fate.
            command.process_group(0);
        }
        let mut child = command.spawn().map_err(|source| JobError::Launch {
            program: self.tool.program.clone(),
            source,
        })?;
        let pgid = child.id();
        self.shutdown.track_group(pgid);

        let (done_tx, done_rx) = mpsc::channel();
        let mut streams = 0;
        if let Some(out) = child.stdout.take() {
            self.spawn_reader(out, Level::Info, &job.id, done_tx.clone());
            streams += 1;
        }
        if let Some(err) = child.stderr.take() {
            self.spawn_reader(err, Level::Warn, &job.id, done_tx.clone());
            streams += 1;
        }
        drop(done_tx);

        let waited = self.wait(&mut child, &job.id);
        // Background processes left by the tool would keep its output pipes open.
        kill_process_group(pgid);
        self.shutdown.untrack_group(pgid);
        self.drain_readers(&done_rx, streams, &job.id);
        let (status, interrupted) = waited?;

        self.log.job(
            Level::Info,
            &job.id,
            format!("tool finished with {}", describe_status(status)),
        );
        if interrupted {
            return Err(JobError::Interrupted);
        }
        if !status.success() {
            return Err(JobError::ToolExit {
                status: describe_status(status),
            });
        }
        if self.sentinel.classify(&job.result_dir) != ArtifactState::Completed {
            return Err(JobError::MissingArtifact {
                artifact: self.sentinel.artifact_path(&job.result_dir),
            });
        }
        Ok(())
    }

    fn wait(&self, child: &mut Child, job_id: &str) -> Result<(ExitStatus, bool), JobError> {
        let mut interrupted = false;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok((status, interrupted)),
                Ok(None) => {}
                Err(err) => {
                    terminate(child);
                    let _ = child.wait();
                    return Err(JobError::Unexpected(format!(
                        "failed to wait for tool: {err}"
                    )));
                }
            }
            if !interrupted
                && self.on_interrupt == InterruptPolicy::Terminate
                && self.shutdown.requested()
            {
                interrupted = true;
                self.log.job(
                    Level::Warn,
                    job_id,
                    format!("shutdown requested; terminating tool (pid {})", child.id()),
                );
                terminate(child);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn spawn_reader<R>(&self, stream: R, level: Level, job_id: &str, done: Sender<()>)
    where
        R: Read + Send + 'static,
    {
        let log = self.log.clone();
        let job_id = job_id.to_string();
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        if !line.is_empty() {
                            log.job(level, &job_id, line);
                        }
                    }
                    Err(err) => {
                        log.job(
                            Level::Warn,
                            &job_id,
                            format!("stopped reading tool output: {err}"),
                        );
                        break;
                    }
                }
            }
            let _ = done.send(());
        });
    }

    /// Waits for the output readers, giving up after `READER_GRACE`.
    fn drain_readers(&self, done: &Receiver<()>, streams: usize, job_id: &str) {
        let deadline = Instant::now() + READER_GRACE;
        for _ in 0..streams {
            let left = deadline.saturating_duration_since(Instant::now());
            if done.recv_timeout(left).is_err() {
                self.log.job(
                    Level::Warn,
                    job_id,
                    "tool output still open after exit; no longer reading it",
                );
                return;
            }
        }
    }
}

/// Kills the tool and, on unix, the rest of its process group.
fn terminate(child: &mut Child) {
    if kill_process_group(child.id()) {
        return;
    }
    let _ = child.kill();
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }
    "unknown status".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{INPUT_PLACEHOLDER, OUTPUT_DIR_PLACEHOLDER};
    use crate::models::LOCK_MARKER_NAME;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        log: Logbook,
        shutdown: Shutdown,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = TempDir::new().expect("tempdir");
            fs::create_dir_all(tmp.path().join("in")).expect("mkdir in");
            fs::create_dir_all(tmp.path().join("out")).expect("mkdir out");
            let log = Logbook::open(&tmp.path().join("logs.txt"), false).expect("log");
            Self {
                tmp,
                log,
                shutdown: Shutdown::new(),
            }
        }

        fn job(&self, id: &str) -> Job {
            let input = self.tmp.path().join("in").join(format!("{id}.fna"));
            fs::write(&input, ">seq\nACGT\n").expect("write input");
            Job::new(id.to_string(), input, &self.tmp.path().join("out"))
        }

        fn calls_file(&self) -> PathBuf {
            self.tmp.path().join("calls.txt")
        }

        /// `sh -c <script> tool <input> <output_dir>`; `$1` and `$2` are the job paths.
        fn executor_with(&self, program: &str, script: &str) -> Executor {
            let script = format!("echo \"$1\" >> '{}'; {script}", self.calls_file().display());
            Executor::new(
                Sentinel::new("index.html"),
                LockManager::new("run-test", Duration::from_secs(3600)),
                ToolSpec {
                    program: program.to_string(),
                    args: vec![
                        "-c".to_string(),
                        script,
                        "tool".to_string(),
                        INPUT_PLACEHOLDER.to_string(),
                        OUTPUT_DIR_PLACEHOLDER.to_string(),
                    ],
                },
                self.log.clone(),
                self.shutdown.clone(),
                InterruptPolicy::Terminate,
            )
        }

        fn executor(&self, script: &str) -> Executor {
            self.executor_with("sh", script)
        }

        fn calls(&self) -> usize {
            fs::read_to_string(self.calls_file())
                .map(|t| t.lines().count())
                .unwrap_or(0)
        }

        fn log_text(&self) -> String {
            fs::read_to_string(self.tmp.path().join("logs.txt")).expect("read log")
        }
    }

    fn assert_unlocked(dir: &Path) {
        assert!(
            !dir.join(LOCK_MARKER_NAME).exists(),
            "lock marker left in {}",
            dir.display()
        );
    }

    #[test]
    fn success_streams_output_and_releases_lock() {
        let fx = Fixture::new();
        let job = fx.job("A");
        let dir = job.result_dir.clone();
        let executor =
            fx.executor("echo analysing; echo 'warning: slow' >&2; echo '<html/>' > \"$2/index.html\"");

        let outcome = executor.run(job);

        assert!(matches!(outcome, JobOutcome::Succeeded), "got {outcome:?}");
        assert_eq!(fx.calls(), 1);
        assert_unlocked(&dir);
        let log = fx.log_text();
        assert!(log.contains("INFO - [A] analysing"), "{log}");
        assert!(log.contains("WARN - [A] warning: slow"), "{log}");
        assert!(log.contains("[A] successfully processed"), "{log}");
    }

    #[test]
    fn exit_zero_without_artifact_is_failure() {
        let fx = Fixture::new();
        let job = fx.job("D");
        let dir = job.result_dir.clone();
        let executor = fx.executor("echo 'crashed after exit code'; exit 0");

        let outcome = executor.run(job);

        assert!(
            matches!(outcome, JobOutcome::Failed(JobError::MissingArtifact { .. })),
            "got {outcome:?}"
        );
        assert!(dir.exists(), "partial directory kept for the next run");
        assert_unlocked(&dir);
    }

    #[test]
    fn nonzero_exit_records_code_even_with_artifact() {
        let fx = Fixture::new();
        let job = fx.job("E");
        let executor = fx.executor("touch \"$2/index.html\"; exit 3");

        let outcome = executor.run(job);

        match outcome {
            JobOutcome::Failed(JobError::ToolExit { status }) => assert_eq!(status, "exit code 3"),
            other => panic!("expected tool exit failure, got {other:?}"),
        }
        assert!(fx.log_text().contains("exit code 3"));
    }

    #[test]
    fn missing_executable_fails_and_releases_lock() {
        let fx = Fixture::new();
        let job = fx.job("F");
        let dir = job.result_dir.clone();
        let executor = fx.executor_with("/definitely/not/a/tool", "true");

        let outcome = executor.run(job);

        assert!(
            matches!(outcome, JobOutcome::Failed(JobError::Launch { .. })),
            "got {outcome:?}"
        );
        assert_unlocked(&dir);
    }

    #[test]
    fn completed_job_is_not_relaunched() {
        let fx = Fixture::new();
        let job = fx.job("B");
        fs::create_dir_all(&job.result_dir).expect("mkdir");
        fs::write(job.result_dir.join("index.html"), "<html/>").expect("artifact");
        let executor = fx.executor("exit 1");

        let outcome = executor.run(job);

        assert!(matches!(outcome, JobOutcome::AlreadyComplete));
        assert_eq!(fx.calls(), 0);
    }

    #[test]
    fn contended_job_does_not_launch_tool() {
        let fx = Fixture::new();
        let job = fx.job("C");
        fs::create_dir_all(&job.result_dir).expect("mkdir");
        let holder = LockManager::new("other-run", Duration::from_secs(3600));
        let Acquire::Acquired(_guard) = holder.try_acquire(&job.result_dir).expect("acquire") else {
            panic!("lock should be free");
        };
        let executor = fx.executor("touch \"$2/index.html\"");

        let outcome = executor.run(job);

        match outcome {
            JobOutcome::Contended { owner_pid } => {
                assert_eq!(owner_pid, Some(std::process::id()));
            }
            other => panic!("expected contention, got {other:?}"),
        }
        assert_eq!(fx.calls(), 0);
    }

    #[test]
    fn shutdown_terminates_running_tool() {
        let fx = Fixture::new();
        let job = fx.job("G");
        let dir = job.result_dir.clone();
        let executor = fx.executor("exec sleep 30");
        let shutdown = fx.shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            shutdown.request();
        });

        let started = Instant::now();
        let outcome = executor.run(job);
        trigger.join().expect("trigger thread");

        assert!(
            matches!(outcome, JobOutcome::Failed(JobError::Interrupted)),
            "got {outcome:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_unlocked(&dir);
    }

    #[test]
    fn background_leftovers_do_not_hold_the_job() {
        let fx = Fixture::new();
        let job = fx.job("H");
        let dir = job.result_dir.clone();
        let executor = fx.executor("(sleep 8 &); touch \"$2/index.html\"; exit 0");

        let started = Instant::now();
        let outcome = executor.run(job);

        assert!(matches!(outcome, JobOutcome::Succeeded), "got {outcome:?}");
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert_unlocked(&dir);
    }

    #[test]
    fn running_tool_group_is_tracked_until_exit() {
        let fx = Fixture::new();
        let job = fx.job("I");
        let executor = fx.executor("exec sleep 30");
        let shutdown = fx.shutdown.clone();
        let killer = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while shutdown.kill_tracked_groups() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
        });

        let outcome = executor.run(job);
        killer.join().expect("killer thread");

        match outcome {
            JobOutcome::Failed(JobError::ToolExit { status }) => assert_eq!(status, "signal 9"),
            other => panic!("expected kill by signal, got {other:?}"),
        }
        assert_eq!(fx.shutdown.kill_tracked_groups(), 0);
    }
}
