use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::InterruptPolicy;

#[derive(Debug, Parser)]
#[command(name = "batchmine")]
#[command(
    about = "Run an analysis tool once per input file, in parallel, resuming where earlier runs stopped."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Reconcile the output directory and process every unfinished input.
    Run(RunArgs),
    /// Show the state of every job without changing anything.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct LayoutArgs {
    /// Directory containing the input files.
    pub input_dir: Option<PathBuf>,
    /// Directory receiving one Result_<name> directory per input.
    pub output_dir: Option<PathBuf>,
    /// JSON or YAML file with defaults for any option.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// File inside each result directory that marks the job complete.
    #[arg(long)]
    pub artifact: Option<PathBuf>,
    /// Input file extension to accept (repeatable).
    #[arg(long = "ext")]
    pub extensions: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub layout: LayoutArgs,
    /// Number of jobs run concurrently.
    #[arg(long)]
    pub jobs: Option<usize>,
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
    /// Program launched for each input file.
    #[arg(long)]
    pub tool: Option<String>,
    /// Age after which a lock marker is considered abandoned.
    #[arg(long = "stale-lock-secs")]
    pub stale_lock_secs: Option<u64>,
    #[arg(long = "on-interrupt", value_enum)]
    pub on_interrupt: Option<InterruptPolicy>,
    /// Do not mirror log entries to stderr.
    #[arg(long, action = ArgAction::SetTrue)]
    pub quiet: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
    /// Tool arguments; {input}, {output_dir} and {name} are expanded per job.
    #[arg(last = true)]
    pub tool_args: Vec<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub layout: LayoutArgs,
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tool_args_follow_double_dash() {
        let cli = Cli::try_parse_from([
            "batchmine",
            "run",
            "genomes",
            "results",
            "--jobs",
            "2",
            "--ext",
            "gbk",
            "--tool",
            "antismash",
            "--",
            "--taxon",
            "fungi",
            "{input}",
            "--output-dir",
            "{output_dir}",
        ])
        .expect("parse");
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.layout.input_dir, Some(PathBuf::from("genomes")));
        assert_eq!(args.layout.output_dir, Some(PathBuf::from("results")));
        assert_eq!(args.jobs, Some(2));
        assert_eq!(args.layout.extensions, vec!["gbk"]);
        assert_eq!(args.tool.as_deref(), Some("antismash"));
        assert_eq!(
            args.tool_args,
            vec!["--taxon", "fungi", "{input}", "--output-dir", "{output_dir}"]
        );
    }
}
