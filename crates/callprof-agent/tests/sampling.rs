//! End-to-end runs against the real platform backends.

use callprof_agent::{CounterKind, Mode, api};
use std::hint::black_box;
use std::time::{Duration, Instant};

callprof_agent::sampling_allocator!();

fn spin(duration: Duration) -> u64 {
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < duration {
        for i in 0..10_000u64 {
            acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
        }
    }
    acc
}

// Both modes share the process-wide profiler, so they run in one test.
#[test]
fn test_cpu_and_heap_sampling() {
    #[cfg(unix)]
    {
        api::start(Mode::Cpu, 1_000_000, 100_000).unwrap();
        black_box(spin(Duration::from_millis(400)));
        api::stop();

        let samples = api::total_samples();
        assert!(samples > 0, "no CPU samples collected");
        let collapsed = api::dump_collapsed(CounterKind::Samples);
        let summed: u64 = collapsed
            .lines()
            .map(|l| l.rsplit(' ').next().unwrap().parse::<u64>().unwrap())
            .sum();
        assert_eq!(summed, samples);
        assert!(api::dump_traces(5).starts_with("--- Execution profile (cpu mode) ---"));
    }

    // Touch the allocator once so it reports itself installed.
    black_box(vec![0u8; 16]);
    api::start(Mode::Heap, 4096, 100_000).unwrap();
    let mut kept = Vec::new();
    for i in 0..1_000 {
        kept.push(black_box(vec![i as u8; 1024]));
    }
    api::stop();
    drop(kept);

    let samples = api::total_samples();
    // 1 MiB allocated at one sample per 4 KiB.
    assert!(samples >= 200, "only {samples} heap samples");
    let summary = api::execute("summary").unwrap();
    assert!(summary.contains("Total bytes"));

    // Nothing is recorded once stopped.
    black_box(vec![0u8; 1 << 20]);
    assert_eq!(api::total_samples(), samples);
}
