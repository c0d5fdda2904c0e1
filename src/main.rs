mod cli;
mod commands;
mod config;
mod ui;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Project;
use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        generate(*shell, &mut cmd, "strata", &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    // Exit 0 on success, 1 when validation or planning fails, 2 when
    // execution fails after partial application (reported by the command).
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            ui::error(&format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let project = Project::load(
        cli.dir.as_deref(),
        cli.state.as_deref(),
        &cli.var_files,
        &cli.vars,
    )?;

    match &cli.command {
        Command::Validate => commands::validate::run(&project),
        Command::Plan(args) => commands::plan::run(&project, args),
        Command::Apply(args) => commands::apply::run(&project, args),
        Command::Destroy(args) => commands::destroy::run(&project, args),
        Command::Completions { .. } => unreachable!("handled before project load"),
    }
}
