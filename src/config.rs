use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::models::Job;

pub const DEFAULT_JOBS: usize = 4;
pub const DEFAULT_ARTIFACT: &str = "index.html";
pub const DEFAULT_EXTENSIONS: &[&str] = &["fna", "fasta"];
pub const DEFAULT_LOG_FILE: &str = "logs.txt";
pub const DEFAULT_STALE_LOCK_SECS: u64 = 7 * 24 * 3600;

pub const INPUT_PLACEHOLDER: &str = "{input}";
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";
pub const NAME_PLACEHOLDER: &str = "{name}";
pub const DEFAULT_TOOL_ARGS: &[&str] = &[INPUT_PLACEHOLDER, "--output-dir", OUTPUT_DIR_PLACEHOLDER];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InterruptPolicy {
    /// Let running tools finish, dispatch nothing new.
    Wait,
    /// Kill running tools and mark their jobs failed.
    Terminate,
}

/// Settings read from `--config`; every field may be overridden on the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub input_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub log_file: Option<PathBuf>,
    pub tool: Option<ToolSpec>,
    pub stale_lock_secs: Option<u64>,
    pub on_interrupt: Option<InterruptPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolSpec {
    pub fn render_args(&self, job: &Job) -> Vec<String> {
        let input = job.input_path.to_string_lossy();
        let output_dir = job.result_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_DIR_PLACEHOLDER, &output_dir)
                    .replace(NAME_PLACEHOLDER, &job.id)
            })
            .collect()
    }
}

/// Where jobs come from and how completion is recognized.
#[derive(Debug, Clone)]
pub struct Layout {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub artifact: PathBuf,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub layout: Layout,
    pub jobs: usize,
    pub log_file: PathBuf,
    pub tool: ToolSpec,
    pub stale_lock_after: Duration,
    pub on_interrupt: InterruptPolicy,
}

pub fn load_config(path: &Path) -> Result<FileConfig> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    let config = if path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
    {
        serde_json::from_str(&text).context("invalid JSON config")?
    } else {
        serde_yaml::from_str(&text).context("invalid YAML config")?
    };
    Ok(config)
}

pub fn normalize_extension(raw: &str) -> String {
    raw.trim().trim_start_matches('.').to_ascii_lowercase()
}

pub fn normalize_extensions(raw: &[String]) -> Vec<String> {
    let source: Vec<String> = if raw.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
    } else {
        raw.to_vec()
    };
    let mut out: Vec<String> = Vec::with_capacity(source.len());
    for ext in source.iter().map(|e| normalize_extension(e)) {
        if !out.contains(&ext) {
            out.push(ext);
        }
    }
    out
}

pub fn validate_layout(layout: &Layout) -> Result<()> {
    if layout.artifact.as_os_str().is_empty() {
        bail!("artifact path cannot be empty");
    }
    if !layout
        .artifact
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        bail!(
            "artifact must be a relative path inside the result directory: {}",
            layout.artifact.display()
        );
    }
    if layout.extensions.is_empty() {
        bail!("at least one input extension is required");
    }
    for ext in &layout.extensions {
        if ext.is_empty() {
            bail!("input extensions cannot be empty");
        }
        if ext.contains(['/', '\\']) {
            bail!("input extension '{ext}' cannot contain path separators");
        }
    }
    Ok(())
}

pub fn validate_run_config(config: &RunConfig) -> Result<()> {
    validate_layout(&config.layout)?;
    if config.jobs < 1 {
        bail!("--jobs must be >= 1");
    }
    if config.tool.program.trim().is_empty() {
        bail!("tool program cannot be empty");
    }
    for placeholder in [INPUT_PLACEHOLDER, OUTPUT_DIR_PLACEHOLDER] {
        if !config.tool.args.iter().any(|a| a.contains(placeholder)) {
            bail!("tool arguments must reference {placeholder}");
        }
    }
    if config.stale_lock_after.is_zero() {
        bail!("--stale-lock-secs must be >= 1");
    }
    Ok(())
}
