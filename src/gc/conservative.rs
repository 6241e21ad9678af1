//! Raw reads of native stacks, registers and root regions.
//!
//! Everything in the crate that looks at memory it did not allocate as a
//! tagged value goes through this module. Words are read with volatile loads
//! and reported as plain `usize`s; deciding whether a word is a reference is
//! left to the heap.

use std::mem::size_of;

use super::{memory_region::MemoryRegion, stack::approximate_stack_pointer};
use crate::utils::{round_down, round_up};

/// Callee-saved registers, written to the stack so a scan of the stack
/// also sees references only held in registers.
#[repr(C, align(16))]
#[derive(Default)]
pub struct SpilledRegisters {
    words: [usize; 16],
}

impl SpilledRegisters {
    #[inline(never)]
    pub fn capture(&mut self) {
        unsafe { spill(self.words.as_mut_ptr()) }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[inline(always)]
        unsafe fn spill(out: *mut usize) {
            std::arch::asm!(
                "mov [{out}], rbx",
                "mov [{out} + 8], rbp",
                "mov [{out} + 16], r12",
                "mov [{out} + 24], r13",
                "mov [{out} + 32], r14",
                "mov [{out} + 40], r15",
                "mov [{out} + 48], rsi",
                "mov [{out} + 56], rdi",
                out = in(reg) out,
                options(nostack, preserves_flags)
            );
        }
    } else if #[cfg(target_arch = "aarch64")] {
        #[inline(always)]
        unsafe fn spill(out: *mut usize) {
            std::arch::asm!(
                "stp x19, x20, [{out}]",
                "stp x21, x22, [{out}, #16]",
                "stp x23, x24, [{out}, #32]",
                "stp x25, x26, [{out}, #48]",
                "stp x27, x28, [{out}, #64]",
                "stp x29, x30, [{out}, #80]",
                out = in(reg) out,
                options(nostack, preserves_flags)
            );
        }
    } else if #[cfg(target_arch = "riscv64")] {
        #[inline(always)]
        unsafe fn spill(out: *mut usize) {
            std::arch::asm!(
                "sd s0, 0({out})",
                "sd s1, 8({out})",
                "sd s2, 16({out})",
                "sd s3, 24({out})",
                "sd s4, 32({out})",
                "sd s5, 40({out})",
                "sd s6, 48({out})",
                "sd s7, 56({out})",
                "sd s8, 64({out})",
                "sd s9, 72({out})",
                "sd s10, 80({out})",
                "sd s11, 88({out})",
                out = in(reg) out,
                options(nostack, preserves_flags)
            );
        }
    } else {
        // No known callee-saved set: rely on the compiler having spilled
        // live values around the opaque call below.
        #[inline(never)]
        unsafe fn spill(out: *mut usize) {
            std::hint::black_box(out);
        }
    }
}

/// Spills registers into the current frame and runs `f` with a stack
/// pointer below the spill area. Everything the caller holds is then in
/// `[sp, stack origin)` for as long as `f` runs.
#[inline(never)]
pub fn with_spilled_registers<R>(f: impl FnOnce(usize) -> R) -> R {
    let mut registers = SpilledRegisters::default();
    registers.capture();
    let sp = approximate_stack_pointer();
    let result = f(sp);
    std::hint::black_box(&registers);
    result
}

/// Calls `visit` with every word-aligned word in `region`.
///
/// # Safety
///
/// The whole region must be mapped and readable.
pub unsafe fn scan_words(region: MemoryRegion, mut visit: impl FnMut(usize)) {
    let start = round_up(region.start(), size_of::<usize>(), 0);
    let end = round_down(region.end(), size_of::<usize>());
    let mut cursor = start;
    while cursor < end {
        visit((cursor as *const usize).read_volatile());
        cursor += size_of::<usize>();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_every_aligned_word() {
        let words = [1usize, 2, 3, 4];
        let start = words.as_ptr() as usize;
        let region = MemoryRegion::from_range(start, start + std::mem::size_of_val(&words));
        let mut seen = vec![];
        unsafe { scan_words(region, |w| seen.push(w)) };
        assert_eq!(seen, words);

        // A misaligned start skips the partial word.
        let region = MemoryRegion::from_range(words.as_ptr() as usize + 1, region.end());
        let mut seen = vec![];
        unsafe { scan_words(region, |w| seen.push(w)) };
        assert_eq!(seen, &words[1..]);
    }

    #[test]
    fn spilled_frame_is_below_caller() {
        let local = 0usize;
        let caller = &local as *const usize as usize;
        with_spilled_registers(|sp| assert!(sp < caller));
    }
}
