//! Agent argument string parsing.
//!
//! The format of the string is `arg[,arg...]` where `arg` is one of:
//!
//! | argument                 | meaning                                                 |
//! |--------------------------|---------------------------------------------------------|
//! | `start`                  | start profiling                                         |
//! | `stop`                   | stop profiling (and dump whatever outputs are selected) |
//! | `status`                 | report whether the profiler runs, and for how long      |
//! | `cpu[:event]`            | profile CPU time or a hardware/software counter         |
//! | `heap`                   | profile heap allocations                                |
//! | `collapsed[=C]`          | dump collapsed stacks, `C` is `samples` or `total`      |
//! | `folded[=C]`             | synonym for `collapsed`                                 |
//! | `summary`                | dump the number of collected samples                    |
//! | `traces[=N]`             | dump the top N call traces                              |
//! | `flat[=N]`               | dump the top N frames (flat profile)                    |
//! | `interval=N`             | sampling interval (ns, events or bytes)                 |
//! | `framebuf=N`             | size of the frame buffer                                |
//! | `file=NAME`              | write dumps to NAME instead of returning them           |
//!
//! Several dump options may be combined in one string.

use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Longest argument string accepted.
pub const MAX_ARGS_LEN: usize = 1024;

/// Default sampling interval: 1 ms of CPU time.
pub const DEFAULT_INTERVAL: u64 = 1_000_000;

/// Default frame buffer size.
pub const DEFAULT_FRAMEBUF: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    Start,
    Stop,
    Status,
    Dump,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Cpu,
    Heap,
}

impl Mode {
    /// Unit of the `total` metric accumulated in this mode.
    pub fn metric_unit(self) -> &'static str {
        match self {
            Mode::Cpu => "ns",
            Mode::Heap => "bytes",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Cpu => "cpu",
            Mode::Heap => "heap",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    #[default]
    CpuClock,
    Cycles,
    ContextSwitches,
    BranchMisses,
    CacheMisses,
    L1dLoadMisses,
    LlcLoadMisses,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::CpuClock,
        EventType::Cycles,
        EventType::ContextSwitches,
        EventType::BranchMisses,
        EventType::CacheMisses,
        EventType::L1dLoadMisses,
        EventType::LlcLoadMisses,
    ];

    /// Name used in `cpu:<event>`.
    pub fn name(self) -> &'static str {
        match self {
            EventType::CpuClock => "cpu-clock",
            EventType::Cycles => "cycles",
            EventType::ContextSwitches => "context-switches",
            EventType::BranchMisses => "branch-misses",
            EventType::CacheMisses => "cache-misses",
            EventType::L1dLoadMisses => "L1-dcache-load-misses",
            EventType::LlcLoadMisses => "LLC-load-misses",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which counter of a call trace a dump reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterKind {
    #[default]
    Samples,
    Total,
}

/// The validated subset of [`Arguments`] the coordinator runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    pub mode: Mode,
    pub event_type: EventType,
    pub interval: u64,
    pub framebuf: usize,
}

impl SamplingConfig {
    pub fn new(mode: Mode, interval: u64, framebuf: usize) -> Self {
        SamplingConfig {
            mode,
            event_type: EventType::CpuClock,
            interval,
            framebuf,
        }
    }

    pub fn with_event(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::InvalidArgument("interval must be > 0".to_string()));
        }
        if self.framebuf == 0 {
            return Err(Error::InvalidArgument("framebuf must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig::new(Mode::Cpu, DEFAULT_INTERVAL, DEFAULT_FRAMEBUF)
    }
}

/// Parsed agent arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arguments {
    pub action: Action,
    pub mode: Mode,
    pub event_type: EventType,
    pub interval: u64,
    pub framebuf: usize,
    pub counter: CounterKind,
    pub dump_collapsed: bool,
    pub dump_summary: bool,
    /// Number of traces to dump, 0 when not requested.
    pub dump_traces: usize,
    /// Number of frames to dump, 0 when not requested.
    pub dump_flat: usize,
    pub file: Option<PathBuf>,
}

impl Default for Arguments {
    fn default() -> Self {
        Arguments {
            action: Action::None,
            mode: Mode::Cpu,
            event_type: EventType::CpuClock,
            interval: DEFAULT_INTERVAL,
            framebuf: DEFAULT_FRAMEBUF,
            counter: CounterKind::Samples,
            dump_collapsed: false,
            dump_summary: false,
            dump_traces: 0,
            dump_flat: 0,
            file: None,
        }
    }
}

impl Arguments {
    /// Parse an argument string on top of the defaults.
    ///
    /// On error nothing is returned, so a caller holding an older
    /// `Arguments` never observes a half-applied string.
    pub fn parse(args: &str) -> Result<Self> {
        if args.len() >= MAX_ARGS_LEN {
            return Err(Error::Config("Argument list too long".to_string()));
        }

        let mut parsed = Arguments::default();
        for arg in args.split(',').filter(|a| !a.is_empty()) {
            let (name, value) = match arg.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (arg, None),
            };

            match name {
                "start" => parsed.action = Action::Start,
                "stop" => parsed.action = Action::Stop,
                "status" => parsed.action = Action::Status,
                "heap" => parsed.mode = Mode::Heap,
                "collapsed" | "folded" => {
                    parsed.select_dump();
                    parsed.dump_collapsed = true;
                    parsed.counter = match value {
                        None | Some("samples") => CounterKind::Samples,
                        Some("total") => CounterKind::Total,
                        Some(other) => {
                            return Err(Error::Config(format!("unknown counter type: {other}")));
                        }
                    };
                }
                "summary" => {
                    parsed.select_dump();
                    parsed.dump_summary = true;
                }
                "traces" => {
                    parsed.select_dump();
                    parsed.dump_traces = parse_limit("traces", value)?;
                }
                "flat" => {
                    parsed.select_dump();
                    parsed.dump_flat = parse_limit("flat", value)?;
                }
                "interval" => parsed.interval = parse_positive("interval", value)?,
                "framebuf" => parsed.framebuf = parse_positive("framebuf", value)? as usize,
                "file" => match value {
                    Some(file) if !file.is_empty() => parsed.file = Some(PathBuf::from(file)),
                    _ => return Err(Error::Config("file must not be empty".to_string())),
                },
                _ if name == "cpu" || name.starts_with("cpu:") => {
                    parsed.mode = Mode::Cpu;
                    if let Some(event) = name.strip_prefix("cpu:") {
                        parsed.event_type = EventType::from_name(event).ok_or_else(|| {
                            Error::Config(format!("unknown event type: {event}"))
                        })?;
                    }
                }
                _ => return Err(Error::Config(format!("unknown argument: {arg}"))),
            }
        }

        Ok(parsed)
    }

    /// Dump options turn an argument string into a dump unless it already
    /// names a control action, whose output they then select.
    fn select_dump(&mut self) {
        if self.action == Action::None {
            self.action = Action::Dump;
        }
    }

    pub fn sampling_config(&self) -> SamplingConfig {
        SamplingConfig {
            mode: self.mode,
            event_type: self.event_type,
            interval: self.interval,
            framebuf: self.framebuf,
        }
    }

    /// True when at least one dump output is selected.
    pub fn has_dump(&self) -> bool {
        self.dump_collapsed || self.dump_summary || self.dump_traces > 0 || self.dump_flat > 0
    }
}

impl FromStr for Arguments {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Arguments::parse(s)
    }
}

fn parse_positive(name: &str, value: Option<&str>) -> Result<u64> {
    match value.and_then(|v| v.parse::<u64>().ok()) {
        Some(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!("{name} must be > 0"))),
    }
}

/// `traces` and `flat` without a value mean "everything".
fn parse_limit(name: &str, value: Option<&str>) -> Result<usize> {
    match value {
        None => Ok(usize::MAX),
        Some(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(Error::Config(format!("{name} must be a positive number"))),
        },
    }
}
