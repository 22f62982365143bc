use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "callprof")]
#[command(about = "Statistical sampling profiler for in-process call traces")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Profile a built-in workload running in this process
    Record {
        /// Agent arguments, e.g. "cpu:cycles,interval=100000,collapsed"
        #[arg(long, short = 'a', default_value = "cpu")]
        args: String,

        /// Recording duration (default: until Ctrl-C)
        #[arg(long, short = 'd', value_parser = parse_duration)]
        duration: Option<Duration>,

        /// Number of worker threads
        #[arg(long, short = 't', default_value = "1")]
        threads: usize,

        /// What the workers do while sampled
        #[arg(long, short = 'w', value_enum, default_value = "cpu")]
        workload: Workload,

        /// Write the report here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Validate agent arguments and show what they select
    Check {
        /// Agent argument string
        args: String,
    },

    /// List sampling events and their availability on this machine
    Events,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workload {
    /// Prime counting and sorting
    Cpu,
    /// String and map building
    Alloc,
    /// Both, alternating
    Mixed,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    // Try humantime first
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    // Try bare number as seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    Err(format!(
        "Invalid duration '{}'. Examples: 500ms, 30s, 5m, 90",
        s
    ))
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Record {
            duration, threads, ..
        } = &self.command
        {
            if *threads == 0 || *threads > 256 {
                return Err(format!(
                    "Thread count must be between 1 and 256, got {}",
                    threads
                ));
            }
            if duration.is_some_and(|d| d.is_zero()) {
                return Err("Duration must be greater than zero".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("12"), Ok(Duration::from_secs(12)));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_record_defaults() {
        let cli = Cli::try_parse_from(["callprof", "record"]).unwrap();
        match &cli.command {
            Command::Record {
                args,
                duration,
                threads,
                workload,
                output,
            } => {
                assert_eq!(args, "cpu");
                assert!(duration.is_none());
                assert_eq!(*threads, 1);
                assert_eq!(*workload, Workload::Cpu);
                assert!(output.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_record_options() {
        let cli = Cli::try_parse_from(["callprof", "record", "--threads", "0"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["callprof", "record", "-d", "0s"]).unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from([
            "callprof", "record", "-a", "heap,flat=10", "-w", "alloc", "-t", "4", "-d", "2s",
        ])
        .unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_check_requires_args() {
        assert!(Cli::try_parse_from(["callprof", "check"]).is_err());
        assert!(Cli::try_parse_from(["callprof", "check", "cpu:cycles"]).is_ok());
    }
}
