//! Descriptors for code owned by a native module.

use crate::trap_handler;
use more_asserts::{debug_assert_le, debug_assert_lt};
use std::slice;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

/// A unique identifier for a `NativeModule` within the process.
///
/// Code descriptors refer to their owning module through this id rather
/// than a pointer, so a descriptor can never dangle into a torn-down
/// module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompiledModuleId(u64);

pub(crate) struct CompiledModuleIdAllocator {
    next: AtomicU64,
}

impl CompiledModuleIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self) -> CompiledModuleId {
        CompiledModuleId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a `WasmCode` blob is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
    Function,
    WasmToJsWrapper,
    LazyStub,
    RuntimeStub,
    InterpreterEntry,
    JumpTable,
}

impl CodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::Function => "wasm function",
            CodeKind::WasmToJsWrapper => "wasm-to-js",
            CodeKind::LazyStub => "lazy-compile",
            CodeKind::RuntimeStub => "runtime-stub",
            CodeKind::InterpreterEntry => "interpreter entry",
            CodeKind::JumpTable => "jump table",
        }
    }
}

/// Which compiler produced a function body. Code that is neither
/// Liftoff- nor Turbofan-compiled (stubs, wrappers, jump tables) is
/// `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Liftoff,
    Turbofan,
    Other,
}

/// Runtime stubs shared by all function bodies. Generated code refers to
/// them symbolically by id; the reference is resolved to the module-local
/// stub copy during relocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RuntimeStubId {
    ThrowTrapUnreachable,
    ThrowTrapMemOutOfBounds,
    ThrowTrapDivByZero,
    ThrowTrapDivUnrepresentable,
    ThrowTrapRemByZero,
    ThrowTrapFloatUnrepresentable,
    ThrowTrapFuncInvalid,
    ThrowTrapFuncSigMismatch,
    AllocateHeapNumber,
    ArgumentsAdaptor,
    CallJavaScript,
    StackGuard,
    ToNumber,
    DoubleToInt,
}

/// Number of distinct runtime stubs; the size of every module's stub
/// table.
pub const RUNTIME_STUB_COUNT: usize = 14;

impl RuntimeStubId {
    pub const ALL: [RuntimeStubId; RUNTIME_STUB_COUNT] = [
        RuntimeStubId::ThrowTrapUnreachable,
        RuntimeStubId::ThrowTrapMemOutOfBounds,
        RuntimeStubId::ThrowTrapDivByZero,
        RuntimeStubId::ThrowTrapDivUnrepresentable,
        RuntimeStubId::ThrowTrapRemByZero,
        RuntimeStubId::ThrowTrapFloatUnrepresentable,
        RuntimeStubId::ThrowTrapFuncInvalid,
        RuntimeStubId::ThrowTrapFuncSigMismatch,
        RuntimeStubId::AllocateHeapNumber,
        RuntimeStubId::ArgumentsAdaptor,
        RuntimeStubId::CallJavaScript,
        RuntimeStubId::StackGuard,
        RuntimeStubId::ToNumber,
        RuntimeStubId::DoubleToInt,
    ];

    /// Decode the stub-id tag embedded at a stub-call relocation site.
    pub fn from_tag(tag: u32) -> Option<RuntimeStubId> {
        Self::ALL.get(tag as usize).copied()
    }
}

/// A PC offset within function code at which a fault is intentional,
/// together with the offset execution continues at when the trap handler
/// intercepts the fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtectedInstructionData {
    pub instr_offset: u32,
    pub landing_offset: u32,
}

/// Output of a compiler: one buffer holding the instruction stream, with
/// the relocation records as a trailing suffix of the same buffer.
#[derive(Clone, Copy, Debug)]
pub struct CodeDesc<'a> {
    pub buffer: &'a [u8],
    pub instr_size: usize,
    pub reloc_size: usize,
    pub constant_pool_size: usize,
}

impl CodeDesc<'_> {
    pub fn instructions(&self) -> &[u8] {
        &self.buffer[..self.instr_size]
    }

    pub fn reloc_info(&self) -> &[u8] {
        &self.buffer[self.buffer.len() - self.reloc_size..]
    }
}

/// Already-assembled code living on the surrounding runtime's heap,
/// copied into a module's arena by the `add_code_copy` family of calls.
#[derive(Clone, Copy, Debug)]
pub struct ExternalCode<'a> {
    pub instructions: &'a [u8],
    pub reloc_info: &'a [u8],
    pub source_positions: &'a [u8],
    pub constant_pool_offset: usize,
    pub stack_slots: u32,
    pub safepoint_table_offset: usize,
    pub handler_table_offset: usize,
}

impl<'a> ExternalCode<'a> {
    /// A bare instruction stream with no relocations or metadata.
    pub fn from_instructions(instructions: &'a [u8]) -> Self {
        Self {
            instructions,
            reloc_info: &[],
            source_positions: &[],
            constant_pool_offset: 0,
            stack_slots: 0,
            safepoint_table_offset: 0,
            handler_table_offset: 0,
        }
    }
}

const NO_TRAP_HANDLER_INDEX: isize = -1;

/// An immutable descriptor of one emitted code blob.
///
/// The instruction bytes live in the owning module's arena, which
/// outlives every descriptor the module hands out; the descriptor itself
/// owns only copies of the relocation and source-position blobs.
pub struct WasmCode {
    instr_start: usize,
    instr_len: usize,
    reloc_info: Box<[u8]>,
    source_positions: Box<[u8]>,
    module_id: CompiledModuleId,
    index: Option<u32>,
    kind: CodeKind,
    tier: Tier,
    constant_pool_offset: Option<usize>,
    stack_slots: u32,
    safepoint_table_offset: usize,
    handler_table_offset: usize,
    protected_instructions: Box<[ProtectedInstructionData]>,
    trap_handler_index: AtomicIsize,
}

impl WasmCode {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instr_start: usize,
        instr_len: usize,
        reloc_info: Box<[u8]>,
        source_positions: Box<[u8]>,
        module_id: CompiledModuleId,
        index: Option<u32>,
        kind: CodeKind,
        constant_pool_offset: Option<usize>,
        stack_slots: u32,
        safepoint_table_offset: usize,
        handler_table_offset: usize,
        protected_instructions: Box<[ProtectedInstructionData]>,
        tier: Tier,
    ) -> Self {
        debug_assert_le!(safepoint_table_offset, instr_len);
        debug_assert_le!(handler_table_offset, instr_len);
        if let Some(offset) = constant_pool_offset {
            debug_assert_le!(offset, instr_len);
        }
        debug_assert!(kind != CodeKind::Function || index.is_some());
        Self {
            instr_start,
            instr_len,
            reloc_info,
            source_positions,
            module_id,
            index,
            kind,
            tier,
            constant_pool_offset,
            stack_slots,
            safepoint_table_offset,
            handler_table_offset,
            protected_instructions,
            trap_handler_index: AtomicIsize::new(NO_TRAP_HANDLER_INDEX),
        }
    }

    pub fn instructions(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.instr_start as *const u8, self.instr_len) }
    }

    pub fn instruction_start(&self) -> usize {
        self.instr_start
    }

    pub fn reloc_info(&self) -> &[u8] {
        &self.reloc_info
    }

    pub fn source_positions(&self) -> &[u8] {
        &self.source_positions
    }

    /// The function index of this code. Panics for anonymous code.
    pub fn index(&self) -> u32 {
        self.index.expect("anonymous code carries no function index")
    }

    /// Anonymous code (runtime stubs, jump tables, lazy stubs) carries no
    /// function index.
    pub fn is_anonymous(&self) -> bool {
        self.index.is_none()
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn is_liftoff(&self) -> bool {
        self.tier == Tier::Liftoff
    }

    pub fn module_id(&self) -> CompiledModuleId {
        self.module_id
    }

    /// The address of the embedded constant pool, if this build exposes
    /// one and the code has one.
    pub fn constant_pool(&self) -> Option<usize> {
        match self.constant_pool_offset {
            Some(offset) if offset < self.instr_len => Some(self.instr_start + offset),
            _ => None,
        }
    }

    pub fn safepoint_table_offset(&self) -> usize {
        self.safepoint_table_offset
    }

    pub fn handler_table_offset(&self) -> usize {
        self.handler_table_offset
    }

    pub fn stack_slots(&self) -> u32 {
        self.stack_slots
    }

    pub fn contains(&self, pc: usize) -> bool {
        self.instr_start <= pc && pc < self.instr_start + self.instr_len
    }

    pub fn protected_instructions(&self) -> &[ProtectedInstructionData] {
        &self.protected_instructions
    }

    pub(crate) fn has_trap_handler_index(&self) -> bool {
        self.trap_handler_index.load(Ordering::Acquire) >= 0
    }

    /// Register the protected-instruction table with the process trap
    /// handler. Only function code is registered, and at most once.
    pub(crate) fn register_trap_handler_data(&self) {
        debug_assert!(!self.has_trap_handler_index());
        if self.kind != CodeKind::Function {
            return;
        }
        let index = trap_handler::register_handler_data(
            self.instr_start,
            self.instr_len,
            &self.protected_instructions,
        )
        .unwrap_or_else(|e| panic!("failed to register trap handler data: {e}"));
        debug_assert_lt!(index, isize::MAX as usize);
        self.trap_handler_index
            .store(index as isize, Ordering::Release);
    }
}

impl Drop for WasmCode {
    fn drop(&mut self) {
        let index = self.trap_handler_index.load(Ordering::Acquire);
        if index >= 0 {
            trap_handler::release_handler_data(index as usize);
        }
    }
}

impl std::fmt::Debug for WasmCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmCode")
            .field("kind", &self.kind.as_str())
            .field("index", &self.index)
            .field("start", &format_args!("{:#x}", self.instr_start))
            .field("len", &self.instr_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_id_tag_roundtrip() {
        for (tag, id) in RuntimeStubId::ALL.iter().enumerate() {
            assert_eq!(RuntimeStubId::from_tag(tag as u32), Some(*id));
            assert_eq!(*id as u32, tag as u32);
        }
        assert_eq!(RuntimeStubId::from_tag(RUNTIME_STUB_COUNT as u32), None);
    }

    #[test]
    fn code_desc_splits_buffer() {
        let mut buffer = vec![0u8; 32];
        buffer[30] = 0xFE;
        let desc = CodeDesc {
            buffer: &buffer,
            instr_size: 24,
            reloc_size: 2,
            constant_pool_size: 0,
        };
        assert_eq!(desc.instructions().len(), 24);
        assert_eq!(desc.reloc_info(), &[0xFE, 0x00]);
    }
}
