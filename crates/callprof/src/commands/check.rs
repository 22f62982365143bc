use crate::error::{Error, Result};
use crate::process;
use callprof_agent::{Action, Arguments, EventType, Mode, backend};

/// Describe what an agent argument string selects and whether this
/// process could run it.
pub fn describe(args: &Arguments) -> String {
    let action = match args.action {
        Action::None => "none",
        Action::Start => "start",
        Action::Stop => "stop",
        Action::Status => "status",
        Action::Dump => "dump",
    };

    let mut out = format!("Action    : {}\n", action);
    out.push_str(&format!("Mode      : {}\n", args.mode));
    if args.mode == Mode::Cpu {
        out.push_str(&format!("Event     : {}\n", args.event_type));
    }
    let unit = match (args.mode, args.event_type) {
        (Mode::Cpu, EventType::CpuClock) | (Mode::Heap, _) => args.mode.metric_unit(),
        (Mode::Cpu, _) => "events",
    };
    out.push_str(&format!("Interval  : {} {}\n", args.interval, unit));
    out.push_str(&format!("Frame buf : {}\n", args.framebuf));

    let mut dumps = Vec::new();
    if args.dump_summary {
        dumps.push("summary".to_string());
    }
    if args.dump_traces > 0 {
        dumps.push(format!("traces={}", args.dump_traces));
    }
    if args.dump_flat > 0 {
        dumps.push(format!("flat={}", args.dump_flat));
    }
    if args.dump_collapsed {
        dumps.push(format!("collapsed={:?}", args.counter).to_lowercase());
    }
    if !dumps.is_empty() {
        out.push_str(&format!("Dumps     : {}\n", dumps.join(", ")));
    }
    if let Some(file) = &args.file {
        out.push_str(&format!("File      : {}\n", file.display()));
    }
    out
}

pub fn run(args: &str) -> Result<()> {
    let parsed = Arguments::parse(args)?;
    print!("{}", describe(&parsed));

    let config = parsed.sampling_config();
    config.validate()?;
    let mut backend = backend::for_config(&config);
    backend.init();
    if !backend.supports(config.mode, config.event_type) {
        if config.mode == Mode::Cpu
            && config.event_type != EventType::CpuClock
            && let Some(level) = process::perf_event_paranoid()
            && level > 1
        {
            return Err(Error::PermissionDenied(format!(
                "{} needs perf counters but perf_event_paranoid={}. \
                 Try: sudo sysctl kernel.perf_event_paranoid=1",
                config.event_type, level
            )));
        }
        let event = match config.mode {
            Mode::Cpu => config.event_type.name(),
            Mode::Heap => "heap",
        };
        return Err(callprof_agent::Error::Unsupported {
            event,
            backend: backend.name(),
        }
        .into());
    }
    println!("Backend   : {} (supported)", backend.name());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let args = Arguments::parse("start,cpu:cycles,interval=100000,flat=10,collapsed=total")
            .unwrap();
        let out = describe(&args);
        assert!(out.contains("Action    : start"));
        assert!(out.contains("Event     : cycles"));
        assert!(out.contains("Interval  : 100000 events"));
        assert!(out.contains("Dumps     : flat=10, collapsed=total"));
    }

    #[test]
    fn test_describe_heap_omits_event() {
        let out = describe(&Arguments::parse("heap,interval=4096").unwrap());
        assert!(out.contains("Mode      : heap"));
        assert!(out.contains("Interval  : 4096 bytes"));
        assert!(!out.contains("Event"));
    }

    #[test]
    fn test_run_rejects_unknown_argument() {
        assert!(matches!(
            run("cpu,verbose"),
            Err(Error::Agent(callprof_agent::Error::Config(_)))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_run_cpu_clock_supported() {
        assert!(run("cpu,interval=1000000").is_ok());
    }
}
