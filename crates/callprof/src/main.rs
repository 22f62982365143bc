use anyhow::Context;
use callprof::cli::{Cli, Command};
use callprof::error::{agent_exit_code, exit_code};
use clap::Parser;
use std::process::ExitCode;

callprof_agent::sampling_allocator!();

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<callprof::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else if let Some(err) = e.downcast_ref::<callprof_agent::Error>() {
                ExitCode::from(agent_exit_code(err) as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Validate CLI arguments
    cli.validate()
        .map_err(callprof::Error::InvalidArgument)
        .context("Invalid arguments")?;

    match cli.command {
        Command::Record {
            args,
            duration,
            threads,
            workload,
            output,
        } => {
            callprof::commands::record::run(&args, duration, threads, workload, output.as_deref())?;
        }
        Command::Check { args } => {
            callprof::commands::check::run(&args)?;
        }
        Command::Events => {
            callprof::commands::events::run()?;
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "callprof", &mut std::io::stdout());
        }
    }

    Ok(())
}
