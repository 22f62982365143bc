//! Counter-driven sampling with Linux `perf_event_open`.
//!
//! One event is opened per thread. Each overflow raises `SIGPROF` on the
//! owning thread (`F_SETOWN_EX` + `F_SETSIG`), and the kernel also writes the
//! user-space callchain into a small ring buffer that the handler reads back,
//! so no unwinding is needed on this path when the kernel provides one.

use super::signal::{self, HandlerGate};
use super::{SIGNAL_SINK, SampleSink, SamplingBackend, Tid};
use crate::args::{EventType, Mode};
use crate::context::SignalContext;
use crate::table::MAX_STACK_DEPTH;
use libc::{c_int, c_ulong, pid_t};
use nix::{ioctl_none_bad, ioctl_write_int_bad, request_code_none};
use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence};

// perf_event constants (from linux/perf_event.h)
const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_TYPE_SOFTWARE: u32 = 1;
const PERF_TYPE_HW_CACHE: u32 = 3;

const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;

const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;

const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
const PERF_COUNT_HW_CACHE_LL: u64 = 2;
const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
const PERF_RECORD_SAMPLE: u32 = 9;
const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

/// Callchain entries at or above this value are context markers, not addresses.
const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

// fcntl commands missing from some libc targets (from asm-generic/fcntl.h)
const F_SETSIG: c_int = 10;
const F_SETOWN_EX: c_int = 15;
const F_OWNER_TID: c_int = 0;

#[repr(C)]
struct FOwnerEx {
    type_: c_int,
    pid: pid_t,
}

const PERF_EVENT_MAGIC: u8 = b'$';
ioctl_none_bad!(perf_event_ioc_disable, request_code_none!(PERF_EVENT_MAGIC, 1));
ioctl_write_int_bad!(perf_event_ioc_refresh, request_code_none!(PERF_EVENT_MAGIC, 2));
ioctl_none_bad!(perf_event_ioc_reset, request_code_none!(PERF_EVENT_MAGIC, 3));

/// Ring buffer data pages per thread (must be a power of two).
const DATA_PAGES: usize = 4;

/// Threads that can be registered at the same time.
const MAX_THREADS: usize = 4096;

const EMPTY_TID: Tid = 0;
const DELETED_TID: Tid = -1;

/// perf_event_attr structure
#[repr(C)]
#[derive(Debug, Clone, Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
}

impl PerfEventAttr {
    const DISABLED_BIT: u64 = 1 << 0;
    const EXCLUDE_KERNEL_BIT: u64 = 1 << 5;
    const EXCLUDE_HV_BIT: u64 = 1 << 6;
    const EXCLUDE_CALLCHAIN_KERNEL_BIT: u64 = 1 << 21;

    fn for_event(event: EventType, period: u64) -> Self {
        let (type_, config) = event_config(event);
        PerfEventAttr {
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            type_,
            config,
            sample_period_or_freq: period,
            sample_type: PERF_SAMPLE_CALLCHAIN,
            wakeup_events_or_watermark: 1,
            flags: Self::DISABLED_BIT
                | Self::EXCLUDE_KERNEL_BIT
                | Self::EXCLUDE_HV_BIT
                | Self::EXCLUDE_CALLCHAIN_KERNEL_BIT,
            ..Default::default()
        }
    }
}

fn event_config(event: EventType) -> (u32, u64) {
    let cache = |id: u64| {
        id | (PERF_COUNT_HW_CACHE_OP_READ << 8) | (PERF_COUNT_HW_CACHE_RESULT_MISS << 16)
    };
    match event {
        EventType::CpuClock => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
        EventType::Cycles => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
        EventType::ContextSwitches => (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES),
        EventType::BranchMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
        EventType::CacheMisses => (PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
        EventType::L1dLoadMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_L1D)),
        EventType::LlcLoadMisses => (PERF_TYPE_HW_CACHE, cache(PERF_COUNT_HW_CACHE_LL)),
    }
}

/// perf_event_mmap_page header, up to the fields read here
#[repr(C)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 928],
    data_head: u64,
    data_tail: u64,
}

/// perf_event_header for records in the ring buffer
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PerfEventHeader {
    type_: u32,
    misc: u16,
    size: u16,
}

/// Per-thread registration, readable from the signal handler.
struct ThreadSlot {
    tid: AtomicI32,
    fd: AtomicI32,
    page: AtomicPtr<u8>,
}

impl ThreadSlot {
    const fn new() -> Self {
        ThreadSlot {
            tid: AtomicI32::new(EMPTY_TID),
            fd: AtomicI32::new(-1),
            page: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

static SLOTS: [ThreadSlot; MAX_THREADS] = [const { ThreadSlot::new() }; MAX_THREADS];
static ARMED: AtomicBool = AtomicBool::new(false);
static INTERVAL: AtomicU64 = AtomicU64::new(0);
static COUNTER_ID: AtomicU32 = AtomicU32::new(0);
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(4096);
static GATE: HandlerGate = HandlerGate::new();

fn find_slot(tid: Tid) -> Option<&'static ThreadSlot> {
    let start = tid as usize % MAX_THREADS;
    for i in 0..MAX_THREADS {
        let slot = &SLOTS[(start + i) % MAX_THREADS];
        match slot.tid.load(Ordering::Acquire) {
            t if t == tid => return Some(slot),
            EMPTY_TID => return None,
            _ => {}
        }
    }
    None
}

fn claim_slot(tid: Tid) -> Option<&'static ThreadSlot> {
    let start = tid as usize % MAX_THREADS;
    for i in 0..MAX_THREADS {
        let slot = &SLOTS[(start + i) % MAX_THREADS];
        let current = slot.tid.load(Ordering::Acquire);
        if (current == EMPTY_TID || current == DELETED_TID)
            && slot
                .tid
                .compare_exchange(current, tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Some(slot);
        }
    }
    None
}

extern "C" fn perf_signal_handler(
    _sig: c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let _guard = GATE.enter();
    if !ARMED.load(Ordering::Acquire) {
        return;
    }
    let Some(sink) = SIGNAL_SINK.get() else {
        return;
    };
    let slot = find_slot(signal::gettid());

    let mut chain = [0u64; MAX_STACK_DEPTH];
    let depth = slot.map_or(0, |s| unsafe { read_call_chain(s, &mut chain) });
    let ctx = unsafe { SignalContext::from_ucontext(ucontext) };
    let call_chain = if depth > 0 { Some(&chain[..depth]) } else { None };

    sink.record_sample(
        &ctx,
        INTERVAL.load(Ordering::Relaxed),
        COUNTER_ID.load(Ordering::Relaxed),
        call_chain,
    );

    // The event disables itself after one overflow; re-arm it for the next one.
    if let Some(slot) = slot {
        let fd = slot.fd.load(Ordering::Acquire);
        if fd >= 0 {
            unsafe {
                let _ = perf_event_ioc_reset(fd);
                let _ = perf_event_ioc_refresh(fd, 1);
            }
        }
    }
}

/// Drain the thread's ring buffer and keep the most recent callchain.
///
/// # Safety
///
/// Must run while `slot` cannot be torn down, i.e. inside `GATE`.
unsafe fn read_call_chain(slot: &ThreadSlot, out: &mut [u64]) -> usize {
    let page = slot.page.load(Ordering::Acquire);
    if page.is_null() {
        return 0;
    }
    unsafe { read_ring(page, PAGE_SIZE.load(Ordering::Relaxed), out) }
}

/// Consume every record between `data_tail` and `data_head` of the ring
/// mapped at `page`, returning the callchain of the last sample.
///
/// # Safety
///
/// `page` must point to a header page followed by `DATA_PAGES` data pages
/// of `page_size` bytes each, aligned to 8.
unsafe fn read_ring(page: *mut u8, page_size: usize, out: &mut [u64]) -> usize {
    let data_size = (DATA_PAGES * page_size) as u64;
    let header = page as *mut PerfEventMmapPage;
    let data = unsafe { page.add(page_size) };

    let head = unsafe { ptr::read_volatile(ptr::addr_of!((*header).data_head)) };
    fence(Ordering::Acquire);
    let mut tail = unsafe { ptr::read_volatile(ptr::addr_of!((*header).data_tail)) };

    // Records are 8-byte aligned and the data area is a multiple of 8,
    // so no u64 read straddles the wrap point.
    let read_u64 = |pos: u64| unsafe { ptr::read_volatile(data.add((pos % data_size) as usize) as *const u64) };

    let mut depth = 0;
    while tail + 8 <= head {
        let event_header = unsafe {
            ptr::read_volatile(data.add((tail % data_size) as usize) as *const PerfEventHeader)
        };
        if event_header.size == 0 {
            break;
        }

        if event_header.type_ == PERF_RECORD_SAMPLE {
            let nr = read_u64(tail + 8);
            depth = 0;
            for i in 0..nr {
                let ip = read_u64(tail + 16 + i * 8);
                if ip >= PERF_CONTEXT_MAX {
                    continue;
                }
                if depth == out.len() {
                    break;
                }
                out[depth] = ip;
                depth += 1;
            }
        }

        tail += event_header.size as u64;
    }

    fence(Ordering::Release);
    unsafe { ptr::write_volatile(ptr::addr_of_mut!((*header).data_tail), head) };
    depth
}

fn perf_event_open(attr: &PerfEventAttr, tid: Tid) -> io::Result<RawFd> {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *const PerfEventAttr,
            tid as pid_t,
            -1 as c_int, // any CPU
            -1 as c_int, // no group
            PERF_FLAG_FD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd as RawFd)
}

/// Route overflow signals of `fd` to thread `tid` as `SIGPROF`.
fn route_signal(fd: RawFd, tid: Tid) -> io::Result<()> {
    let owner = FOwnerEx {
        type_: F_OWNER_TID,
        pid: tid as pid_t,
    };
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0
            || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_ASYNC) < 0
            || libc::fcntl(fd, F_SETSIG, libc::SIGPROF) < 0
            || libc::fcntl(fd, F_SETOWN_EX, &owner as *const FOwnerEx) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn mmap_size() -> usize {
    (1 + DATA_PAGES) * PAGE_SIZE.load(Ordering::Relaxed)
}

/// Check /proc/sys/kernel/perf_event_paranoid
fn perf_paranoid_hint() -> Option<String> {
    let content = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid").ok()?;
    let level: i32 = content.trim().parse().unwrap_or(2);
    (level > 1).then(|| {
        format!(
            "perf_event_paranoid={}, counter access may be restricted. \
             Consider: sudo sysctl kernel.perf_event_paranoid=1",
            level
        )
    })
}

#[derive(Debug, Default)]
pub struct PerfEventBackend {
    attr: Option<PerfEventAttr>,
    available: Option<Vec<EventType>>,
    threads: Vec<Tid>,
}

impl PerfEventBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event types that could be opened on this machine, once `init` ran.
    pub fn available_events(&self) -> Option<&[EventType]> {
        self.available.as_deref()
    }

    fn open_for_thread(&mut self, attr: &PerfEventAttr, tid: Tid) -> io::Result<()> {
        let fd = perf_event_open(attr, tid)?;

        let size = mmap_size();
        let page = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if page == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        if let Err(err) = route_signal(fd, tid) {
            unsafe {
                libc::munmap(page, size);
                libc::close(fd);
            }
            return Err(err);
        }
        Self::attach(tid, fd, page as *mut u8)?;
        self.threads.push(tid);
        Ok(())
    }

    /// Publish `fd` and its ring buffer in the thread's slot and arm the
    /// counter. On failure both are released and the slot is freed.
    fn attach(tid: Tid, fd: RawFd, page: *mut u8) -> io::Result<()> {
        let Some(slot) = claim_slot(tid) else {
            unsafe {
                libc::munmap(page as *mut libc::c_void, mmap_size());
                libc::close(fd);
            }
            return Err(io::Error::other("too many threads registered"));
        };
        slot.page.store(page, Ordering::Release);
        slot.fd.store(fd, Ordering::Release);

        let armed = unsafe {
            let _ = perf_event_ioc_reset(fd);
            perf_event_ioc_refresh(fd, 1)
        };
        if let Err(errno) = armed {
            Self::close_thread(tid);
            return Err(io::Error::from(errno));
        }
        Ok(())
    }

    fn close_thread(tid: Tid) {
        let Some(slot) = find_slot(tid) else {
            return;
        };
        let fd = slot.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                let _ = perf_event_ioc_disable(fd);
            }
        }
        let page = slot.page.swap(ptr::null_mut(), Ordering::AcqRel);
        // A handler that loaded the old values finishes before anything is unmapped.
        GATE.drain();
        unsafe {
            if !page.is_null() {
                libc::munmap(page as *mut libc::c_void, mmap_size());
            }
            if fd >= 0 {
                libc::close(fd);
            }
        }
        slot.tid.store(DELETED_TID, Ordering::Release);
    }

    fn probe(event: EventType) -> bool {
        let attr = PerfEventAttr::for_event(event, 1_000_000);
        match perf_event_open(&attr, 0) {
            Ok(fd) => {
                unsafe { libc::close(fd) };
                true
            }
            Err(e) => {
                log::debug!("perf event {} unavailable: {}", event, e);
                false
            }
        }
    }
}

impl SamplingBackend for PerfEventBackend {
    fn name(&self) -> &'static str {
        "perf_events"
    }

    fn init(&mut self) {
        if self.available.is_some() {
            return;
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size > 0 {
            PAGE_SIZE.store(page_size as usize, Ordering::Relaxed);
        }
        let available: Vec<EventType> = EventType::ALL
            .into_iter()
            .filter(|&e| Self::probe(e))
            .collect();
        if available.is_empty()
            && let Some(hint) = perf_paranoid_hint()
        {
            log::warn!("{}", hint);
        }
        self.available = Some(available);
    }

    fn supports(&self, mode: Mode, event: EventType) -> bool {
        mode == Mode::Cpu
            && self
                .available
                .as_ref()
                .is_none_or(|available| available.contains(&event))
    }

    fn start(&mut self, interval: u64, event: EventType, sink: &'static dyn SampleSink) -> bool {
        if interval == 0 || !self.supports(Mode::Cpu, event) {
            return false;
        }
        if self.attr.is_some() {
            self.stop();
        }

        SIGNAL_SINK.install(sink);
        INTERVAL.store(interval, Ordering::Relaxed);
        let counter_id = EventType::ALL.iter().position(|&e| e == event).unwrap_or(0) + 1;
        COUNTER_ID.store(counter_id as u32, Ordering::Relaxed);
        if let Err(e) = signal::install_handler(libc::SIGPROF, perf_signal_handler) {
            log::warn!("Cannot install SIGPROF handler: {}", e);
            return false;
        }

        self.attr = Some(PerfEventAttr::for_event(event, interval));
        ARMED.store(true, Ordering::Release);
        self.create_for_all_threads();

        if self.threads.is_empty() {
            ARMED.store(false, Ordering::Release);
            self.attr = None;
            log::warn!("perf event {} could not be opened for any thread", event);
            return false;
        }
        log::debug!(
            "perf event {} armed on {} threads, period {}",
            event,
            self.threads.len(),
            interval
        );
        true
    }

    fn stop(&mut self) {
        ARMED.store(false, Ordering::Release);
        self.destroy_for_all_threads();
        self.attr = None;
    }

    fn create_for_thread(&mut self, tid: Tid) {
        let Some(attr) = self.attr.clone() else {
            return;
        };
        if self.threads.contains(&tid) {
            return;
        }
        if let Err(e) = self.open_for_thread(&attr, tid) {
            log::debug!("perf event not opened for thread {}: {}", tid, e);
        }
    }

    fn destroy_for_thread(&mut self, tid: Tid) {
        if let Some(pos) = self.threads.iter().position(|&t| t == tid) {
            self.threads.swap_remove(pos);
            Self::close_thread(tid);
        }
    }

    fn create_for_all_threads(&mut self) {
        let entries = match fs::read_dir("/proc/self/task") {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot list threads: {}", e);
                return;
            }
        };
        let tids: Vec<Tid> = entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect();
        for tid in tids {
            self.create_for_thread(tid);
        }
    }

    fn destroy_for_all_threads(&mut self) {
        for tid in std::mem::take(&mut self.threads) {
            Self::close_thread(tid);
        }
    }

    fn call_chain(&self, buf: &mut [u64]) -> usize {
        let _guard = GATE.enter();
        match find_slot(signal::gettid()) {
            Some(slot) => unsafe { read_call_chain(slot, buf) },
            None => 0,
        }
    }
}

impl Drop for PerfEventBackend {
    fn drop(&mut self) {
        if self.attr.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_layout() {
        // PERF_ATTR_SIZE_VER6
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 120);
        assert_eq!(std::mem::offset_of!(PerfEventMmapPage, data_head), 1024);
    }

    #[test]
    fn test_cache_event_config() {
        assert_eq!(
            event_config(EventType::LlcLoadMisses),
            (PERF_TYPE_HW_CACHE, 2 | (1 << 16))
        );
        assert_eq!(
            event_config(EventType::ContextSwitches),
            (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES)
        );
        let attr = PerfEventAttr::for_event(EventType::Cycles, 10_000);
        assert_eq!(attr.sample_period_or_freq, 10_000);
        assert_eq!(attr.flags & PerfEventAttr::DISABLED_BIT, PerfEventAttr::DISABLED_BIT);
    }

    #[test]
    fn test_thread_slots() {
        // Large tids far from anything a test thread registers.
        let tid: Tid = 3_000_001;
        assert!(find_slot(tid).is_none());
        let slot = claim_slot(tid).unwrap();
        assert!(std::ptr::eq(find_slot(tid).unwrap(), slot));

        // A colliding tid probes past the first one.
        let other = tid + MAX_THREADS as Tid;
        let other_slot = claim_slot(other).unwrap();
        assert!(!std::ptr::eq(slot, other_slot));

        slot.tid.store(DELETED_TID, Ordering::Release);
        assert!(std::ptr::eq(find_slot(other).unwrap(), other_slot));
        other_slot.tid.store(DELETED_TID, Ordering::Release);
    }

    const TEST_PAGE: usize = 4096;

    /// Header page plus data pages, addressed by absolute ring positions.
    struct FakeRing {
        words: Vec<u64>,
    }

    impl FakeRing {
        fn new() -> Self {
            FakeRing {
                words: vec![0; (1 + DATA_PAGES) * TEST_PAGE / 8],
            }
        }

        fn data_size() -> u64 {
            (DATA_PAGES * TEST_PAGE) as u64
        }

        fn put(&mut self, pos: u64, value: u64) {
            let index = TEST_PAGE / 8 + (pos % Self::data_size()) as usize / 8;
            self.words[index] = value;
        }

        /// Write a record at `pos`, returning the position after it.
        fn record(&mut self, pos: u64, type_: u32, body: &[u64]) -> u64 {
            let size = (8 + body.len() * 8) as u16;
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&type_.to_ne_bytes());
            bytes[6..].copy_from_slice(&size.to_ne_bytes());
            self.put(pos, u64::from_ne_bytes(bytes));
            for (i, &word) in body.iter().enumerate() {
                self.put(pos + 8 + i as u64 * 8, word);
            }
            pos + size as u64
        }

        fn sample(&mut self, pos: u64, chain: &[u64]) -> u64 {
            let mut body = vec![chain.len() as u64];
            body.extend_from_slice(chain);
            self.record(pos, PERF_RECORD_SAMPLE, &body)
        }

        fn set_window(&mut self, tail: u64, head: u64) {
            let base = std::mem::offset_of!(PerfEventMmapPage, data_head) / 8;
            self.words[base] = head;
            self.words[base + 1] = tail;
        }

        fn tail(&self) -> u64 {
            self.words[std::mem::offset_of!(PerfEventMmapPage, data_tail) / 8]
        }

        fn read(&mut self, out: &mut [u64]) -> usize {
            unsafe { read_ring(self.words.as_mut_ptr() as *mut u8, TEST_PAGE, out) }
        }
    }

    const PERF_CONTEXT_USER: u64 = -512i64 as u64;
    const PERF_RECORD_COMM: u32 = 3;

    #[test]
    fn test_ring_keeps_latest_chain_without_context_markers() {
        let mut ring = FakeRing::new();
        let mut pos = ring.record(0, PERF_RECORD_COMM, &[0x6f6f66, 0]);
        pos = ring.sample(pos, &[PERF_CONTEXT_USER, 0xa, 0xb, 0xc]);
        let head = ring.sample(pos, &[PERF_CONTEXT_USER, 0xd, 0xe]);
        ring.set_window(0, head);

        let mut out = [0u64; 8];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(&out[..2], &[0xd, 0xe]);
        assert_eq!(ring.tail(), head);

        // Nothing new since the last read.
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn test_ring_sample_wraps_around() {
        let mut ring = FakeRing::new();
        // Third lap, header and nr in the last 16 bytes, frames at the start.
        let tail = 3 * FakeRing::data_size() - 16;
        let head = ring.sample(tail, &[0x1, 0x2, 0x3]);
        ring.set_window(tail, head);

        let mut out = [0u64; 8];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..3], &[0x1, 0x2, 0x3]);
        assert_eq!(ring.tail(), head);
    }

    #[test]
    fn test_ring_chain_capped_by_buffer() {
        let mut ring = FakeRing::new();
        let head = ring.sample(0, &[0x1, 0x2, 0x3, 0x4]);
        ring.set_window(0, head);

        let mut out = [0u64; 2];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out, [0x1, 0x2]);
    }

    #[test]
    fn test_ring_stops_at_empty_record() {
        let mut ring = FakeRing::new();
        // A zero-sized header ends the walk; the tail still catches up.
        ring.set_window(0, 64);
        let mut out = [0u64; 4];
        assert_eq!(ring.read(&mut out), 0);
        assert_eq!(ring.tail(), 64);
    }

    #[test]
    fn test_failed_arm_releases_slot() {
        let tid: Tid = 3_000_101;
        let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        assert!(fd >= 0);
        let page = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);

        // /dev/null is not a perf event, so REFRESH fails.
        assert!(PerfEventBackend::attach(tid, fd, page as *mut u8).is_err());
        assert!(find_slot(tid).is_none());
    }

    #[test]
    fn test_unprobed_backend_rejects_zero_interval() {
        struct Nothing;
        impl SampleSink for Nothing {
            fn record_sample(
                &self,
                _ctx: &dyn crate::context::ExecutionContext,
                _weight: u64,
                _counter_id: u32,
                _call_chain: Option<&[u64]>,
            ) {
            }
        }
        static SINK: Nothing = Nothing;

        let mut backend = PerfEventBackend::new();
        assert!(!backend.start(0, EventType::Cycles, &SINK));
        assert!(!backend.supports(Mode::Heap, EventType::Cycles));
        backend.stop();
    }
}
