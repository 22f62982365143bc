//! Interrupted execution state, exposed only through the operations the
//! unwinder needs: the program counter and a frame-pointer walk.
//!
//! Walking relies on frame pointers. Build the profiled program with
//! `RUSTFLAGS="-C force-frame-pointers=yes"` for complete stacks; without
//! them traces degrade to the interrupted PC plus whatever chain survives.

/// Lowest address considered a valid frame pointer.
const MIN_FRAME_ADDR: usize = 0x1000;

/// Highest user-space address on the supported 64-bit targets.
const MAX_FRAME_ADDR: usize = 0x7fff_ffff_ffff;

/// Largest gap between two consecutive frames before the chain is considered broken.
const MAX_FRAME_GAP: usize = 8 * 1024 * 1024;

pub trait ExecutionContext {
    /// Program counter of the innermost frame, 0 if unavailable.
    fn pc(&self) -> u64;

    /// Fill `frames` innermost first and return how many were written.
    ///
    /// Must not allocate: this runs inside signal handlers.
    fn walk(&self, frames: &mut [u64]) -> usize;
}

/// Walk a frame-pointer chain starting at `fp`.
///
/// Each frame record is `[saved fp, return address]`, which holds for both
/// x86_64 (`rbp`) and aarch64 (`x29`). The walk stops on a misaligned,
/// out-of-range or non-increasing frame pointer, or on a null return address.
///
/// # Safety
///
/// `fp` must be null or point into readable stack memory whose frame records
/// link upward the way the validation above expects.
pub unsafe fn walk_frame_pointers(mut fp: *const usize, frames: &mut [u64]) -> usize {
    let mut depth = 0;

    while !fp.is_null() && depth < frames.len() {
        let fp_val = fp as usize;
        if fp_val & 0x7 != 0 {
            break;
        }
        if !(MIN_FRAME_ADDR..=MAX_FRAME_ADDR).contains(&fp_val) {
            break;
        }

        let ret_addr = unsafe { *fp.add(1) };
        if ret_addr == 0 {
            break;
        }

        frames[depth] = ret_addr as u64;
        depth += 1;

        let next_fp = unsafe { *fp as *const usize };
        if next_fp <= fp || (next_fp as usize) - fp_val > MAX_FRAME_GAP {
            break;
        }
        fp = next_fp;
    }

    depth
}

/// Context delivered to a `SA_SIGINFO` signal handler.
pub struct SignalContext {
    pc: u64,
    fp: *const usize,
}

impl SignalContext {
    /// # Safety
    ///
    /// `ucontext` must be null or the third argument of a `SA_SIGINFO` handler
    /// currently executing on this thread.
    pub unsafe fn from_ucontext(ucontext: *mut libc::c_void) -> Self {
        if ucontext.is_null() {
            return SignalContext {
                pc: 0,
                fp: std::ptr::null(),
            };
        }
        let (pc, fp) = unsafe { registers(ucontext as *const libc::ucontext_t) };
        SignalContext {
            pc,
            fp: fp as *const usize,
        }
    }
}

impl ExecutionContext for SignalContext {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn walk(&self, frames: &mut [u64]) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let mut depth = 0;
        if self.pc != 0 {
            frames[0] = self.pc;
            depth = 1;
        }
        depth + unsafe { walk_frame_pointers(self.fp, &mut frames[depth..]) }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn registers(uc: *const libc::ucontext_t) -> (u64, usize) {
    let gregs = unsafe { &(*uc).uc_mcontext.gregs };
    (
        gregs[libc::REG_RIP as usize] as u64,
        gregs[libc::REG_RBP as usize] as usize,
    )
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn registers(uc: *const libc::ucontext_t) -> (u64, usize) {
    let mc = unsafe { &(*uc).uc_mcontext };
    (mc.pc, mc.regs[29] as usize)
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn registers(uc: *const libc::ucontext_t) -> (u64, usize) {
    let ss = unsafe { &(*(*uc).uc_mcontext).__ss };
    (ss.__rip, ss.__rbp as usize)
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe fn registers(uc: *const libc::ucontext_t) -> (u64, usize) {
    let ss = unsafe { &(*(*uc).uc_mcontext).__ss };
    (ss.__pc, ss.__fp as usize)
}

#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
unsafe fn registers(_uc: *const libc::ucontext_t) -> (u64, usize) {
    (0, 0)
}

/// Context of the calling thread at the point of capture.
///
/// Used where there is no interrupt, e.g. allocation sampling.
pub struct CurrentContext {
    fp: *const usize,
}

impl CurrentContext {
    #[inline(always)]
    pub fn capture() -> Self {
        CurrentContext {
            fp: current_frame_pointer(),
        }
    }
}

impl ExecutionContext for CurrentContext {
    fn pc(&self) -> u64 {
        if self.fp.is_null() {
            return 0;
        }
        unsafe { *self.fp.add(1) as u64 }
    }

    fn walk(&self, frames: &mut [u64]) -> usize {
        unsafe { walk_frame_pointers(self.fp, frames) }
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_frame_pointer() -> *const usize {
    let fp: *const usize;
    unsafe {
        std::arch::asm!(
            "mov {}, rbp",
            out(reg) fp,
            options(nomem, nostack, preserves_flags)
        );
    }
    fp
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn current_frame_pointer() -> *const usize {
    let fp: *const usize;
    unsafe {
        std::arch::asm!(
            "mov {}, x29",
            out(reg) fp,
            options(nomem, nostack, preserves_flags)
        );
    }
    fp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn current_frame_pointer() -> *const usize {
    std::ptr::null()
}

/// A frame list supplied by the host instead of a real interrupt.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticContext<'a> {
    frames: &'a [u64],
}

impl<'a> SyntheticContext<'a> {
    /// `frames` is innermost first.
    pub fn new(frames: &'a [u64]) -> Self {
        SyntheticContext { frames }
    }
}

impl ExecutionContext for SyntheticContext<'_> {
    fn pc(&self) -> u64 {
        self.frames.first().copied().unwrap_or(0)
    }

    fn walk(&self, frames: &mut [u64]) -> usize {
        let n = self.frames.len().min(frames.len());
        frames[..n].copy_from_slice(&self.frames[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay out `[saved fp, return address]` records at increasing addresses
    /// inside one buffer, terminated by a null saved fp.
    fn fake_stack(ret_addrs: &[usize]) -> Vec<usize> {
        let mut stack = vec![0usize; ret_addrs.len() * 4 + 2];
        let base = stack.as_ptr() as usize;
        for (i, &ret) in ret_addrs.iter().enumerate() {
            let slot = i * 4;
            let next = if i + 1 < ret_addrs.len() {
                base + (slot + 4) * std::mem::size_of::<usize>()
            } else {
                0
            };
            stack[slot] = next;
            stack[slot + 1] = ret;
        }
        stack
    }

    #[test]
    fn test_walk_follows_chain() {
        let stack = fake_stack(&[0x1111, 0x2222, 0x3333]);
        let mut frames = [0u64; 8];
        let n = unsafe { walk_frame_pointers(stack.as_ptr(), &mut frames) };
        assert_eq!(&frames[..n], &[0x1111, 0x2222, 0x3333]);
    }

    #[test]
    fn test_walk_is_capped_by_buffer() {
        let stack = fake_stack(&[1, 2, 3, 4, 5, 6]);
        let mut frames = [0u64; 4];
        let n = unsafe { walk_frame_pointers(stack.as_ptr(), &mut frames) };
        assert_eq!(n, 4);
        assert_eq!(frames, [1, 2, 3, 4]);
    }

    #[test]
    fn test_walk_rejects_bad_pointers() {
        let mut frames = [0u64; 4];
        assert_eq!(unsafe { walk_frame_pointers(std::ptr::null(), &mut frames) }, 0);
        assert_eq!(unsafe { walk_frame_pointers(0x10 as *const usize, &mut frames) }, 0);

        let stack = fake_stack(&[0xaaaa]);
        let misaligned = (stack.as_ptr() as usize + 1) as *const usize;
        assert_eq!(unsafe { walk_frame_pointers(misaligned, &mut frames) }, 0);
    }

    #[test]
    fn test_walk_stops_on_downward_link() {
        let mut stack = fake_stack(&[0x10, 0x20]);
        // Point the first record back at itself.
        stack[0] = stack.as_ptr() as usize;
        let mut frames = [0u64; 4];
        let n = unsafe { walk_frame_pointers(stack.as_ptr(), &mut frames) };
        assert_eq!(&frames[..n], &[0x10]);
    }

    #[test]
    fn test_signal_context_prepends_pc() {
        let stack = fake_stack(&[0x2000, 0x3000]);
        let ctx = SignalContext {
            pc: 0x1000,
            fp: stack.as_ptr(),
        };
        let mut frames = [0u64; 8];
        let n = ctx.walk(&mut frames);
        assert_eq!(&frames[..n], &[0x1000, 0x2000, 0x3000]);
        assert_eq!(ctx.pc(), 0x1000);

        let empty = unsafe { SignalContext::from_ucontext(std::ptr::null_mut()) };
        assert_eq!(empty.pc(), 0);
        assert_eq!(empty.walk(&mut frames), 0);
    }

    #[test]
    fn test_synthetic_context() {
        let ctx = SyntheticContext::new(&[7, 8, 9]);
        assert_eq!(ctx.pc(), 7);
        let mut frames = [0u64; 2];
        assert_eq!(ctx.walk(&mut frames), 2);
        assert_eq!(frames, [7, 8]);
    }
}
