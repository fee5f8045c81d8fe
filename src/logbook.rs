use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub job: Option<String>,
    pub message: String,
}

impl LogEntry {
    pub fn render(&self) -> String {
        let stamp = self.timestamp.format(TIMESTAMP_FORMAT);
        match &self.job {
            Some(job) => format!("{stamp} - {} - [{job}] {}\n", self.level, self.message),
            None => format!("{stamp} - {} - {}\n", self.level, self.message),
        }
    }
}

struct Sink {
    file: Option<File>,
    echo: bool,
    echo_level: Level,
    write_failed: bool,
}

/// Single append target shared by every worker.
///
/// Entries are rendered before the mutex is taken and written with one
/// `write_all` + `flush`, so lines from different workers never interleave
/// and nothing sits in a userspace buffer when the process dies.
#[derive(Clone)]
pub struct Logbook {
    sink: Arc<Mutex<Sink>>,
    path: Option<PathBuf>,
}

impl fmt::Debug for Logbook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logbook").field("path", &self.path).finish()
    }
}

impl Logbook {
    pub fn open(path: &Path, echo: bool) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::with_sink(Some(file), Some(path.to_path_buf()), echo))
    }

    /// Console-only logbook, used by read-only commands.
    pub fn console(echo: bool) -> Self {
        Self::with_sink(None, None, echo)
    }

    fn with_sink(file: Option<File>, path: Option<PathBuf>, echo: bool) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink {
                file,
                echo,
                echo_level: Level::Info,
                write_failed: false,
            })),
            path,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, entry: LogEntry) {
        let line = entry.render();
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = sink.file.as_mut() {
            let written = file
                .write_all(line.as_bytes())
                .and_then(|()| file.flush());
            if let Err(err) = written
                && !sink.write_failed
            {
                sink.write_failed = true;
                eprintln!("warning: failed to write log entry: {err}");
            }
        }
        if sink.echo && entry.level >= sink.echo_level {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(line.as_bytes());
        }
    }

    pub fn log(&self, level: Level, job: Option<&str>, message: impl Into<String>) {
        self.append(LogEntry {
            timestamp: Local::now(),
            level,
            job: job.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, None, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(Level::Warn, None, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, None, message);
    }

    pub fn job(&self, level: Level, job: &str, message: impl Into<String>) {
        self.log(level, Some(job), message);
    }
}
