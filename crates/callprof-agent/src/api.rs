//! Process-wide embedding interface.
//!
//! A host that does not want to own a [`Coordinator`] uses these functions;
//! they all operate on one lazily created coordinator that lives until the
//! process exits.

use crate::args::{Action, Arguments, CounterKind, Mode, SamplingConfig};
use crate::coordinator::{Coordinator, Status};
use crate::dump::{self, FrameResolver};
use crate::error::Result;
use std::fs;
use std::sync::OnceLock;

static PROFILER: OnceLock<Coordinator> = OnceLock::new();

/// The process-wide coordinator.
pub fn profiler() -> &'static Coordinator {
    PROFILER.get_or_init(Coordinator::new)
}

pub fn start(mode: Mode, interval: u64, framebuf: usize) -> Result<()> {
    profiler().start(SamplingConfig::new(mode, interval, framebuf))
}

pub fn stop() {
    profiler().stop()
}

pub fn status() -> Status {
    profiler().status()
}

pub fn total_samples() -> u64 {
    profiler().total_samples()
}

pub fn dump_collapsed(counter: CounterKind) -> String {
    profiler().dump_collapsed(counter)
}

/// Summary followed by the `max` heaviest traces; 0 means all of them.
pub fn dump_traces(max: usize) -> String {
    traces_report(profiler(), max)
}

/// Summary followed by the `max` heaviest frames; 0 means all of them.
pub fn dump_flat(max: usize) -> String {
    flat_report(profiler(), max)
}

fn traces_report(coordinator: &Coordinator, max: usize) -> String {
    coordinator.with_snapshot(|snapshot, resolver| {
        let mut out = dump::summary(snapshot);
        out.push('\n');
        out.push_str(&dump::traces(snapshot, limit(max), resolver));
        out
    })
}

fn flat_report(coordinator: &Coordinator, max: usize) -> String {
    coordinator.with_snapshot(|snapshot, resolver| {
        let mut out = dump::summary(snapshot);
        out.push('\n');
        out.push_str(&dump::flat(snapshot, limit(max), resolver));
        out
    })
}

pub fn thread_started() {
    profiler().thread_started()
}

pub fn thread_ended() {
    profiler().thread_ended()
}

pub fn set_resolver(resolver: impl FrameResolver + 'static) {
    profiler().set_resolver(resolver)
}

/// Parse and run an agent argument string against the process-wide coordinator.
pub fn execute(args: &str) -> Result<String> {
    execute_on(profiler(), args)
}

/// Parse and run an agent argument string.
///
/// `stop` and plain dump strings return the selected dumps. When `file` is
/// given the output is written there and an empty string is returned.
pub fn execute_on(coordinator: &'static Coordinator, args: &str) -> Result<String> {
    let args = Arguments::parse(args)?;

    let out = match args.action {
        Action::None => String::new(),
        Action::Start => {
            coordinator.start(args.sampling_config())?;
            "Profiling started\n".to_string()
        }
        Action::Stop => {
            coordinator.stop();
            let mut out = "Profiling stopped\n".to_string();
            out.push_str(&render_dumps(coordinator, &args));
            out
        }
        Action::Status => format!("{}\n", coordinator.status()),
        Action::Dump => render_dumps(coordinator, &args),
    };

    match &args.file {
        Some(file) if args.has_dump() => {
            fs::write(file, &out)?;
            log::debug!("Wrote profile to {}", file.display());
            Ok(String::new())
        }
        _ => Ok(out),
    }
}

fn render_dumps(coordinator: &Coordinator, args: &Arguments) -> String {
    coordinator.with_snapshot(|snapshot, resolver| {
        let mut out = String::new();
        if args.dump_summary {
            out.push_str(&dump::summary(snapshot));
        }
        if args.dump_traces > 0 {
            out.push_str(&dump::traces(snapshot, args.dump_traces, resolver));
        }
        if args.dump_flat > 0 {
            out.push_str(&dump::flat(snapshot, args.dump_flat, resolver));
        }
        if args.dump_collapsed {
            out.push_str(&dump::collapsed(snapshot, args.counter, resolver));
        }
        out
    })
}

fn limit(max: usize) -> usize {
    if max == 0 { usize::MAX } else { max }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ManualBackend, SampleSink};
    use crate::context::SyntheticContext;
    use crate::error::Error;

    fn manual() -> &'static Coordinator {
        Box::leak(Box::new(Coordinator::with_backend(ManualBackend::new())))
    }

    #[test]
    fn test_execute_dispatches_actions() {
        let coordinator = manual();
        assert_eq!(execute_on(coordinator, "").unwrap(), "");
        assert_eq!(
            execute_on(coordinator, "status").unwrap(),
            "Profiler is not active\n"
        );

        execute_on(coordinator, "start,interval=1000,framebuf=4096").unwrap();
        assert!(coordinator.is_running());
        assert!(matches!(
            execute_on(coordinator, "start"),
            Err(Error::AlreadyRunning)
        ));

        coordinator.record_sample(&SyntheticContext::new(&[0x10, 0x20]), 1000, 0, None);
        let out = execute_on(coordinator, "stop,collapsed,summary").unwrap();
        assert!(!coordinator.is_running());
        assert!(out.starts_with("Profiling stopped\n--- Execution profile"));
        assert!(out.ends_with("0x20;0x10 1\n"));

        let out = execute_on(coordinator, "collapsed=total").unwrap();
        assert_eq!(out, "0x20;0x10 1000\n");
    }

    #[test]
    fn test_execute_rejects_bad_arguments_without_side_effects() {
        let coordinator = manual();
        assert!(matches!(
            execute_on(coordinator, "start,interval=0"),
            Err(Error::Config(_))
        ));
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.total_samples(), 0);
    }

    #[test]
    fn test_execute_writes_file() {
        let coordinator = manual();
        execute_on(coordinator, "start").unwrap();
        coordinator.record_sample(&SyntheticContext::new(&[0x30]), 1, 0, None);

        let path = std::env::temp_dir().join(format!("callprof-api-{}.txt", std::process::id()));
        let args = format!("stop,flat=3,file={}", path.display());
        assert_eq!(execute_on(coordinator, &args).unwrap(), "");

        let written = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).ok();
        assert!(written.contains("0x30"));
    }

    fn header_total(report: &str) -> u64 {
        report
            .lines()
            .find_map(|l| l.strip_prefix("Total samples      : "))
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn test_reports_agree_while_running() {
        let coordinator = manual();
        coordinator.start(SamplingConfig::default()).unwrap();

        let stop = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut i = 0u64;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let frames = [0x100 + i % 8, 0x200];
                    coordinator.record_sample(&SyntheticContext::new(&frames), 1, 0, None);
                    i += 1;
                }
            });

            for _ in 0..50 {
                let report = traces_report(coordinator, 0);
                let listed: u64 = report
                    .lines()
                    .filter(|l| l.starts_with("--- ") && !l.starts_with("--- Execution"))
                    .map(|l| l.split(' ').nth(1).unwrap().parse::<u64>().unwrap())
                    .sum();
                assert_eq!(listed, header_total(&report));

                let report = flat_report(coordinator, 0);
                // Every trace has 0x200 at the root, so its inclusive count is the total.
                let root = report.lines().find(|l| l.ends_with("  0x200")).map(|l| {
                    l.split_whitespace().nth(2).unwrap().parse::<u64>().unwrap()
                });
                assert_eq!(root.unwrap_or(0), header_total(&report));
            }
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
        });
        coordinator.stop();
    }

    #[test]
    fn test_limit_zero_means_all() {
        assert_eq!(limit(0), usize::MAX);
        assert_eq!(limit(7), 7);
    }
}
