use crate::error::{Error, Result};
use callprof_agent::EventType;
use comfy_table::{Table, presets::UTF8_FULL};

/// Where an event's samples come from.
fn source(event: EventType) -> &'static str {
    match event {
        EventType::CpuClock => "interval timer",
        EventType::ContextSwitches => "perf software",
        EventType::Cycles | EventType::BranchMisses | EventType::CacheMisses => "perf hardware",
        EventType::L1dLoadMisses | EventType::LlcLoadMisses => "perf hardware cache",
    }
}

#[cfg(target_os = "linux")]
fn available() -> Vec<EventType> {
    use callprof_agent::SamplingBackend;
    use callprof_agent::backend::PerfEventBackend;

    let mut perf = PerfEventBackend::new();
    perf.init();
    let mut events = perf.available_events().map(<[_]>::to_vec).unwrap_or_default();
    // cpu-clock always has the interval timer behind it
    if !events.contains(&EventType::CpuClock) {
        events.push(EventType::CpuClock);
    }
    events
}

#[cfg(all(unix, not(target_os = "linux")))]
fn available() -> Vec<EventType> {
    vec![EventType::CpuClock]
}

#[cfg(not(unix))]
fn available() -> Vec<EventType> {
    Vec::new()
}

pub fn render(available: &[EventType]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Event", "Argument", "Source", "Available"]);
    for event in EventType::ALL {
        table.add_row(vec![
            event.name().to_string(),
            format!("cpu:{}", event.name()),
            source(event).to_string(),
            if available.contains(&event) { "yes" } else { "no" }.to_string(),
        ]);
    }
    table.to_string()
}

pub fn run() -> Result<()> {
    if cfg!(not(unix)) {
        return Err(Error::UnsupportedPlatform(
            "CPU sampling needs SIGPROF, which this platform lacks".to_string(),
        ));
    }
    let available = available();
    println!("{}", render(&available));
    if available.len() < EventType::ALL.len() {
        eprintln!(
            "Hardware events may need a lower kernel.perf_event_paranoid \
             (sysctl kernel.perf_event_paranoid=1)"
        );
    }
    println!("Heap mode (\"heap\") samples allocations when the sampling allocator is installed.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_every_event() {
        let out = render(&[EventType::CpuClock]);
        for event in EventType::ALL {
            assert!(out.contains(&format!("cpu:{}", event.name())));
        }
        assert!(out.contains("interval timer"));
        assert!(out.contains("perf hardware cache"));
    }

    #[test]
    #[cfg(unix)]
    fn test_cpu_clock_always_available() {
        assert!(available().contains(&EventType::CpuClock));
    }
}
