//! Emission and patching of the indirect-call jump table.
//!
//! The jump table is one code blob with a fixed-width slot per
//! non-imported function; all wasm-to-wasm calls go through the callee's
//! slot, so retiering and lazy compilation replace code by patching a
//! single slot.

use crate::mmap;
use more_asserts::assert_le;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Width in bytes of one jump-table slot. Architecture-specific; slot
/// `i` always starts at `table_start + i * JUMP_TABLE_SLOT_SIZE`.
#[cfg(target_arch = "x86_64")]
pub const JUMP_TABLE_SLOT_SIZE: usize = 16;

/// Width in bytes of one jump-table slot. Architecture-specific; slot
/// `i` always starts at `table_start + i * JUMP_TABLE_SLOT_SIZE`.
///
/// On aarch64 a slot branches through a 64-bit literal at the end of the
/// slot, so patching is one aligned store and reaches the whole address
/// space.
#[cfg(target_arch = "aarch64")]
pub const JUMP_TABLE_SLOT_SIZE: usize = 32;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("jump-table slots are not implemented for this architecture");

#[cfg(target_arch = "aarch64")]
const NOP: u32 = 0xD503_201F;

/// Emits jump-table slots into a writable code region.
///
/// The caller provides `CODE_ALIGNMENT`-aligned memory and is responsible
/// for flushing the instruction cache once emission is complete.
pub struct JumpTableAssembler {
    base: usize,
    capacity: usize,
    pc: usize,
}

impl JumpTableAssembler {
    pub fn new(base: usize, capacity: usize) -> Self {
        debug_assert_eq!(base % crate::module::CODE_ALIGNMENT, 0);
        Self {
            base,
            capacity,
            pc: 0,
        }
    }

    /// Offset of the next emitted byte from the table start.
    pub fn pc_offset(&self) -> usize {
        self.pc
    }

    fn emit(&mut self, bytes: &[u8]) {
        assert_le!(self.pc + bytes.len(), self.capacity);
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.base + self.pc) as *mut u8,
                bytes.len(),
            );
        }
        self.pc += bytes.len();
    }

    /// Emit a slot that materializes `func_index` in the register the
    /// lazy-compile stub expects and branches to the stub.
    #[cfg(target_arch = "x86_64")]
    pub fn emit_lazy_compile_jump_slot(&mut self, func_index: u32, lazy_compile_target: usize) {
        let mut insns = [0u8; 11];
        // mov r10d, func_index
        insns[0] = 0x41;
        insns[1] = 0xBA;
        insns[2..6].copy_from_slice(&func_index.to_le_bytes());
        // jmp rel32
        insns[6] = 0xE9;
        let next_pc = self.base + self.pc + insns.len();
        let rel = lazy_compile_target as i64 - next_pc as i64;
        debug_assert!(i32::try_from(rel).is_ok());
        insns[7..11].copy_from_slice(&(rel as i32).to_le_bytes());
        self.emit(&insns);
    }

    /// Emit a slot that materializes `func_index` in the register the
    /// lazy-compile stub expects and branches to the stub.
    #[cfg(target_arch = "aarch64")]
    pub fn emit_lazy_compile_jump_slot(&mut self, func_index: u32, lazy_compile_target: usize) {
        debug_assert_eq!(self.pc % JUMP_TABLE_SLOT_SIZE, 0);
        let mut slot = [0u8; JUMP_TABLE_SLOT_SIZE];
        // ldr w8, #16 (function-index literal)
        slot[0..4].copy_from_slice(&0x1800_0088u32.to_le_bytes());
        // ldr x16, #20 (branch-target literal)
        slot[4..8].copy_from_slice(&0x5800_00B0u32.to_le_bytes());
        // br x16
        slot[8..12].copy_from_slice(&0xD61F_0200u32.to_le_bytes());
        slot[12..16].copy_from_slice(&NOP.to_le_bytes());
        slot[16..20].copy_from_slice(&func_index.to_le_bytes());
        slot[24..32].copy_from_slice(&(lazy_compile_target as u64).to_le_bytes());
        self.emit(&slot);
    }

    /// Pad with no-ops up to the next slot boundary.
    #[cfg(target_arch = "x86_64")]
    pub fn nop_bytes(&mut self, count: usize) {
        for _ in 0..count {
            self.emit(&[0x90]);
        }
    }

    /// Pad with no-ops up to the next slot boundary.
    #[cfg(target_arch = "aarch64")]
    pub fn nop_bytes(&mut self, count: usize) {
        debug_assert_eq!(count % 4, 0);
        for _ in 0..count / 4 {
            self.emit(&NOP.to_le_bytes());
        }
    }

    /// Redirect `slot_addr` to branch to `target`.
    ///
    /// The rewrite is a single aligned store, so a core concurrently
    /// executing through the table observes either the old target or the
    /// new one. A thread already past the first instruction of a lazy
    /// slot still reaches the lazy stub; lazy compilation of an
    /// already-published function re-resolves through the table.
    #[cfg(target_arch = "x86_64")]
    pub fn patch_jump_table_slot(slot_addr: usize, target: usize, flush_icache: bool) {
        debug_assert_eq!(slot_addr % 8, 0);
        let mut bytes = [0u8; 8];
        // jmp rel32, padded with a 3-byte nop.
        bytes[0] = 0xE9;
        let rel = target as i64 - (slot_addr + 5) as i64;
        debug_assert!(i32::try_from(rel).is_ok());
        bytes[1..5].copy_from_slice(&(rel as i32).to_le_bytes());
        bytes[5..8].copy_from_slice(&[0x0F, 0x1F, 0x00]);
        unsafe { &*(slot_addr as *const AtomicU64) }
            .store(u64::from_le_bytes(bytes), Ordering::SeqCst);
        if flush_icache {
            mmap::flush_icache(slot_addr, JUMP_TABLE_SLOT_SIZE);
        }
    }

    /// Redirect `slot_addr` to branch to `target`.
    ///
    /// The rewrite is a single aligned store of the slot's branch-target
    /// literal, so a core concurrently executing through the table
    /// observes either the old target or the new one.
    #[cfg(target_arch = "aarch64")]
    pub fn patch_jump_table_slot(slot_addr: usize, target: usize, flush_icache: bool) {
        let literal = slot_addr + 24;
        debug_assert_eq!(literal % 8, 0);
        unsafe { &*(literal as *const AtomicU64) }.store(target as u64, Ordering::SeqCst);
        if flush_icache {
            mmap::flush_icache(slot_addr, JUMP_TABLE_SLOT_SIZE);
        }
    }

    /// Decode the address a slot currently branches to.
    #[cfg(all(test, target_arch = "x86_64"))]
    pub(crate) fn slot_target_for_testing(slot_addr: usize) -> usize {
        unsafe {
            match *(slot_addr as *const u8) {
                0xE9 => {
                    let rel = ptr::read_unaligned((slot_addr + 1) as *const i32);
                    (slot_addr as i64 + 5 + rel as i64) as usize
                }
                // Lazy slot: the branch follows the 6-byte index move.
                0x41 => {
                    let rel = ptr::read_unaligned((slot_addr + 7) as *const i32);
                    (slot_addr as i64 + 11 + rel as i64) as usize
                }
                byte => panic!("unrecognized jump-table slot prefix {byte:#x}"),
            }
        }
    }

    /// Decode the address a slot currently branches to.
    #[cfg(all(test, target_arch = "aarch64"))]
    pub(crate) fn slot_target_for_testing(slot_addr: usize) -> usize {
        unsafe { ptr::read_unaligned((slot_addr + 24) as *const u64) as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct SlotBuffer([u8; JUMP_TABLE_SLOT_SIZE * 4]);

    #[test]
    fn lazy_slot_branches_to_stub() {
        let mut buffer = SlotBuffer([0; JUMP_TABLE_SLOT_SIZE * 4]);
        let base = buffer.0.as_mut_ptr() as usize;
        let stub = base + 3 * JUMP_TABLE_SLOT_SIZE;

        let mut jtasm = JumpTableAssembler::new(base, buffer.0.len());
        for i in 0..2u32 {
            assert_eq!(i as usize * JUMP_TABLE_SLOT_SIZE, jtasm.pc_offset());
            jtasm.emit_lazy_compile_jump_slot(i, stub);
            jtasm.nop_bytes((i as usize + 1) * JUMP_TABLE_SLOT_SIZE - jtasm.pc_offset());
        }
        assert_eq!(jtasm.pc_offset(), 2 * JUMP_TABLE_SLOT_SIZE);

        assert_eq!(JumpTableAssembler::slot_target_for_testing(base), stub);
        assert_eq!(
            JumpTableAssembler::slot_target_for_testing(base + JUMP_TABLE_SLOT_SIZE),
            stub
        );
    }

    #[test]
    fn patched_slot_branches_to_new_target() {
        let mut buffer = SlotBuffer([0; JUMP_TABLE_SLOT_SIZE * 4]);
        let base = buffer.0.as_mut_ptr() as usize;
        let stub = base + 3 * JUMP_TABLE_SLOT_SIZE;
        let function = base + 2 * JUMP_TABLE_SLOT_SIZE;

        let mut jtasm = JumpTableAssembler::new(base, buffer.0.len());
        jtasm.emit_lazy_compile_jump_slot(0, stub);
        jtasm.nop_bytes(JUMP_TABLE_SLOT_SIZE - jtasm.pc_offset());

        JumpTableAssembler::patch_jump_table_slot(base, function, false);
        assert_eq!(JumpTableAssembler::slot_target_for_testing(base), function);

        // Repatching (retiering) keeps working on an already-patched slot.
        JumpTableAssembler::patch_jump_table_slot(base, stub, false);
        assert_eq!(JumpTableAssembler::slot_target_for_testing(base), stub);
    }
}
