mod cli;
mod commands;
mod config;
mod error;
mod executor;
mod lock;
mod logbook;
mod models;
mod pool;
mod reconcile;
mod runtime;
mod sentinel;
mod summary;

use clap::Parser;

pub fn run() -> i32 {
    let cli = cli::Cli::parse();
    match commands::execute(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            2
        }
    }
}
