//! Built-in workloads sampled by `callprof record`.

use crate::cli::Workload;
use callprof_agent::api;
use std::collections::HashMap;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

/// Run `workload` on `threads` threads until `stop` is set or `deadline` passes.
///
/// Returns the number of completed iterations over all threads.
pub fn run(workload: Workload, threads: usize, stop: &AtomicBool, deadline: Option<Instant>) -> u64 {
    let iterations = AtomicU64::new(0);

    thread::scope(|scope| {
        for index in 0..threads {
            let iterations = &iterations;
            scope.spawn(move || {
                api::thread_started();
                let mut done = 0u64;
                while !stop.load(Ordering::Relaxed) && deadline.is_none_or(|d| Instant::now() < d) {
                    black_box(iteration(workload, index as u64 + done));
                    done += 1;
                }
                api::thread_ended();
                iterations.fetch_add(done, Ordering::Relaxed);
            });
        }
    });

    iterations.load(Ordering::Relaxed)
}

fn iteration(workload: Workload, seed: u64) -> usize {
    match workload {
        Workload::Cpu => calculate_primes(2000) + bubble_sort(300),
        Workload::Alloc => build_index(2000) + render_report(200),
        Workload::Mixed if seed % 2 == 0 => calculate_primes(2000) + bubble_sort(300),
        Workload::Mixed => build_index(2000) + render_report(200),
    }
}

#[inline(never)]
pub fn calculate_primes(limit: usize) -> usize {
    let mut count = 0;
    for n in 2..=limit {
        if is_prime(n) {
            count += 1;
        }
    }
    count
}

#[inline(never)]
fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n == 2 {
        return true;
    }
    if n.is_multiple_of(2) {
        return false;
    }

    let limit = (n as f64).sqrt() as usize + 1;
    for i in (3..=limit).step_by(2) {
        if n.is_multiple_of(i) {
            return false;
        }
    }
    true
}

#[inline(never)]
pub fn bubble_sort(size: usize) -> usize {
    let mut data: Vec<i32> = (0..size as i32).rev().collect();

    for i in 0..data.len() {
        for j in 0..data.len() - 1 - i {
            if data[j] > data[j + 1] {
                data.swap(j, j + 1);
            }
        }
    }

    data.iter().sum::<i32>() as usize
}

#[inline(never)]
pub fn build_index(entries: usize) -> usize {
    let mut index: HashMap<String, Vec<u32>> = HashMap::new();
    for i in 0..entries {
        index
            .entry(format!("key-{}", i % 97))
            .or_default()
            .push(i as u32);
    }
    index.values().map(Vec::len).sum()
}

#[inline(never)]
pub fn render_report(lines: usize) -> usize {
    (0..lines)
        .map(|i| format!("line {}: {}", i, "x".repeat(i % 64)))
        .collect::<Vec<_>>()
        .join("\n")
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_workload_results() {
        assert_eq!(calculate_primes(100), 25);
        assert_eq!(bubble_sort(10), 45);
        assert_eq!(build_index(200), 200);
        assert!(render_report(3) > 0);
    }

    #[test]
    fn test_run_stops_at_deadline() {
        let stop = AtomicBool::new(false);
        let deadline = Instant::now() + Duration::from_millis(50);
        let iterations = run(Workload::Mixed, 2, &stop, Some(deadline));
        assert!(iterations > 0);
        assert!(Instant::now() >= deadline);
    }

    #[test]
    fn test_run_honors_stop_flag() {
        let stop = AtomicBool::new(true);
        assert_eq!(run(Workload::Cpu, 1, &stop, None), 0);
    }
}
