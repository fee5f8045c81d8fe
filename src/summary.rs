use serde::Serialize;
use std::fmt::Write;

use crate::logbook::Logbook;
use crate::models::{JobOutcome, JobReport};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub already_complete: usize,
    pub contended: usize,
    pub not_started: usize,
}

impl RunSummary {
    pub fn tally(already_complete: usize, reports: &[JobReport]) -> Self {
        let mut summary = Self {
            already_complete,
            ..Self::default()
        };
        for report in reports {
            match report.outcome {
                JobOutcome::Succeeded => summary.succeeded += 1,
                JobOutcome::Failed(_) => summary.failed += 1,
                JobOutcome::AlreadyComplete => summary.already_complete += 1,
                JobOutcome::Contended { .. } => summary.contended += 1,
                JobOutcome::NotStarted => summary.not_started += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.already_complete + self.contended + self.not_started
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.not_started > 0 {
            1
        } else {
            0
        }
    }

    pub fn log(&self, log: &Logbook) {
        let mut line = format!(
            "Processing complete: succeeded={} failed={} already_complete={}",
            self.succeeded, self.failed, self.already_complete
        );
        if self.contended > 0 {
            let _ = write!(line, " contended={}", self.contended);
        }
        if self.not_started > 0 {
            let _ = write!(line, " not_started={}", self.not_started);
        }
        if self.failed > 0 || self.not_started > 0 {
            log.warn(line);
        } else {
            log.info(line);
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::from("\nProcessing Summary:\n");
        let _ = writeln!(out, "  succeeded:        {}", self.succeeded);
        let _ = writeln!(out, "  failed:           {}", self.failed);
        let _ = writeln!(out, "  already complete: {}", self.already_complete);
        if self.contended > 0 {
            let _ = writeln!(out, "  locked elsewhere: {}", self.contended);
        }
        if self.not_started > 0 {
            let _ = writeln!(out, "  not started:      {}", self.not_started);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use std::time::Duration;

    fn report(id: &str, outcome: JobOutcome) -> JobReport {
        JobReport {
            job_id: id.to_string(),
            outcome,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn tally_counts_each_terminal_class() {
        let reports = vec![
            report("A", JobOutcome::Succeeded),
            report("C", JobOutcome::Succeeded),
            report("D", JobOutcome::Failed(JobError::MissingArtifact {
                artifact: "Result_D/index.html".into(),
            })),
            report("E", JobOutcome::AlreadyComplete),
        ];
        let summary = RunSummary::tally(3, &reports);
        assert_eq!(
            summary,
            RunSummary {
                succeeded: 2,
                failed: 1,
                already_complete: 4,
                contended: 0,
                not_started: 0,
            }
        );
        assert_eq!(summary.total(), 7);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn render_hides_empty_optional_rows() {
        let summary = RunSummary {
            succeeded: 2,
            already_complete: 1,
            ..RunSummary::default()
        };
        let text = summary.render();
        assert!(text.contains("succeeded:        2"));
        assert!(text.contains("failed:           0"));
        assert!(text.contains("already complete: 1"));
        assert!(!text.contains("not started"));
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn nonzero_extras_appear_in_render_and_log() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let log_path = tmp.path().join("logs.txt");
        let log = Logbook::open(&log_path, false).expect("log");
        let summary = RunSummary {
            succeeded: 1,
            contended: 2,
            not_started: 3,
            ..RunSummary::default()
        };

        let text = summary.render();
        assert!(text.contains("  locked elsewhere: 2\n"), "{text}");
        assert!(text.contains("  not started:      3\n"), "{text}");

        summary.log(&log);
        let logged = std::fs::read_to_string(&log_path).expect("read log");
        assert!(
            logged.contains(
                "WARN - Processing complete: succeeded=1 failed=0 already_complete=0 contended=2 not_started=3"
            ),
            "{logged}"
        );
    }
}
