use crate::cli::Workload;
use crate::error::Error;
use crate::symbols::SymbolResolver;
use crate::workload;
use anyhow::Context;
use callprof_agent::{Action, Arguments, api};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Dumps produced when the agent arguments select none.
const DEFAULT_DUMPS: &str = "summary,traces=5,flat=20";

pub fn run(
    args: &str,
    duration: Option<Duration>,
    threads: usize,
    workload: Workload,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let parsed = Arguments::parse(args).map_err(Error::from)?;
    if matches!(parsed.action, Action::Start | Action::Stop | Action::Status) {
        return Err(Error::InvalidArgument(
            "record starts and stops the profiler itself, drop start/stop/status".to_string(),
        )
        .into());
    }

    eprintln!("Loading debug symbols...");
    match SymbolResolver::for_current_process() {
        Ok(resolver) => {
            eprintln!(
                "Loaded {} functions and {} address ranges",
                resolver.function_count(),
                resolver.range_count()
            );
            api::set_resolver(resolver);
        }
        Err(e) => eprintln!("Warning: {}, reporting raw addresses", e),
    }

    let stop = Arc::new(AtomicBool::new(false));
    let s = stop.clone();
    ctrlc::set_handler(move || {
        s.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl-C handler")?;

    let config = parsed.sampling_config();
    api::profiler().start(config).map_err(Error::from)?;
    eprintln!(
        "Profiling {} mode ({}, interval {}) on {} thread(s){}",
        config.mode,
        config.event_type,
        config.interval,
        threads,
        if duration.is_some() { "" } else { ", Ctrl-C to stop" }
    );

    let start = Instant::now();
    let iterations = workload::run(workload, threads, &stop, duration.map(|d| start + d));
    api::stop();

    eprintln!(
        "Recording complete: {} samples, {} iterations in {:.2?}",
        api::total_samples(),
        iterations,
        start.elapsed()
    );

    let report = api::execute(&report_args(&parsed, args)).map_err(Error::from)?;
    if let Some(file) = &parsed.file {
        eprintln!("Report written to {}", file.display());
        return Ok(());
    }

    match output.map(Path::to_path_buf).or_else(|| default_output(&parsed)) {
        Some(path) => {
            fs::write(&path, &report)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Report written to {}", path.display());
        }
        None => print!("{}", report),
    }
    Ok(())
}

/// Agent arguments that render the report, keeping any `file=` target.
fn report_args(parsed: &Arguments, args: &str) -> String {
    match &parsed.file {
        _ if parsed.has_dump() => args.to_string(),
        Some(file) => format!("{},file={}", DEFAULT_DUMPS, file.display()),
        None => DEFAULT_DUMPS.to_string(),
    }
}

/// Collapsed stacks feed a flame graph renderer, so they go to a file named
/// after the process and time unless an output was given.
fn default_output(args: &Arguments) -> Option<PathBuf> {
    if !args.dump_collapsed {
        return None;
    }
    let timestamp = chrono::Local::now().format("%y%m%d%H%M%S");
    Some(PathBuf::from(format!(
        "callprof.{}.{}.collapsed",
        nix::unistd::getpid(),
        timestamp
    )))
}
