//! Executable-memory management for a WebAssembly engine.
//!
//! This crate owns the native-code side of a wasm runtime: it reserves
//! virtual address space for generated code, lays compiled function
//! bodies out inside it, keeps the pages write-xor-execute, routes every
//! wasm-to-wasm call through a patchable jump table, and answers
//! PC-to-code queries from stack walkers and trap handlers.
//!
//! The entry point is [`WasmCodeManager`], the process-wide authority
//! over code space. It hands out [`NativeModule`]s, each owning one or
//! more reservations and the code published into them as [`WasmCode`]
//! descriptors.

mod code;
mod jump_table;
mod manager;
mod mmap;
mod module;
mod pool;
mod reloc;
pub mod trap_handler;

pub use crate::code::{
    CodeDesc, CodeKind, CompiledModuleId, ExternalCode, ProtectedInstructionData, RuntimeStubId,
    Tier, WasmCode, RUNTIME_STUB_COUNT,
};
pub use crate::jump_table::{JumpTableAssembler, JUMP_TABLE_SLOT_SIZE};
pub use crate::manager::{
    CodeManagerConfig, ModuleEnv, WasmCodeManager, MAX_WASM_CODE_MEMORY,
};
pub use crate::mmap::{page_size, Permission, VirtualMemory};
pub use crate::module::{NativeModule, NativeModuleModificationScope, CODE_ALIGNMENT};
pub use crate::pool::{AddressRange, DisjointAllocationPool};
pub use crate::reloc::{
    RelocEntry, RelocInfoWriter, RelocIterator, RelocMode, RelocModeMask, RELOC_ENTRY_SIZE,
};
