//! Per-module ownership of executable code space.

use crate::code::{
    CodeDesc, CodeKind, CompiledModuleId, ExternalCode, ProtectedInstructionData, RuntimeStubId,
    Tier, WasmCode, RUNTIME_STUB_COUNT,
};
use crate::jump_table::{JumpTableAssembler, JUMP_TABLE_SLOT_SIZE};
use crate::manager::{ModuleEnv, WasmCodeManager};
use crate::mmap::{self, round_up, Permission, VirtualMemory};
use crate::pool::{AddressRange, DisjointAllocationPool};
use crate::reloc::{RelocIterator, RelocMode, RelocModeMask};
use anyhow::{Context, Result};
use more_asserts::{assert_le, assert_lt};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Alignment of every code blob inside a module's arena. Jump-table
/// patching relies on it: an aligned slot start makes the patch a single
/// aligned store.
pub const CODE_ALIGNMENT: usize = 16;

/// Owns the virtual-memory reservations holding one wasm module's
/// generated code, the table of published function code, the runtime-stub
/// copies and the jump table.
///
/// All mutation is serialized through an internal lock, so the module can
/// be shared across compiler threads as `Arc<NativeModule>`. Code
/// descriptors handed out by a module are valid for as long as the module
/// is alive; their instruction bytes live in the module's arena.
pub struct NativeModule {
    me: Weak<NativeModule>,
    id: CompiledModuleId,
    num_functions: u32,
    num_imported_functions: u32,
    can_request_more_memory: bool,
    use_trap_handler: AtomicBool,
    lazy_compile_frozen: AtomicBool,
    manager: Arc<WasmCodeManager>,
    inner: Mutex<ModuleInner>,
}

struct ModuleInner {
    /// All code owned by this module, ascending by instruction start, for
    /// binary-search PC lookup.
    owned_code: Vec<Arc<WasmCode>>,
    /// Published function code, indexed by `func_index -
    /// num_imported_functions`.
    code_table: Box<[Option<Arc<WasmCode>>]>,
    runtime_stub_table: [Option<Arc<WasmCode>>; RUNTIME_STUB_COUNT],
    jump_table: Option<Arc<WasmCode>>,
    free_code_space: DisjointAllocationPool,
    allocated_code_space: DisjointAllocationPool,
    owned_code_space: Vec<VirtualMemory>,
    committed_code_space: usize,
    modification_scope_depth: usize,
    is_executable: bool,
    #[cfg(test)]
    protection_transition_count: usize,
}

impl NativeModule {
    pub(crate) fn new(
        id: CompiledModuleId,
        env: &ModuleEnv,
        can_request_more: bool,
        code_space: VirtualMemory,
        manager: Arc<WasmCodeManager>,
    ) -> Arc<NativeModule> {
        assert_le!(env.num_imported_functions, env.num_functions);
        let num_wasm_functions = env.num_functions - env.num_imported_functions;
        let free_code_space = DisjointAllocationPool::new(AddressRange::new(
            code_space.address(),
            code_space.end(),
        ));

        let module = Arc::new_cyclic(|me| NativeModule {
            me: me.clone(),
            id,
            num_functions: env.num_functions,
            num_imported_functions: env.num_imported_functions,
            can_request_more_memory: can_request_more,
            use_trap_handler: AtomicBool::new(env.use_trap_handler),
            lazy_compile_frozen: AtomicBool::new(false),
            manager,
            inner: Mutex::new(ModuleInner {
                owned_code: Vec::with_capacity(env.num_functions as usize),
                code_table: vec![None; num_wasm_functions as usize].into_boxed_slice(),
                runtime_stub_table: std::array::from_fn(|_| None),
                jump_table: None,
                free_code_space,
                allocated_code_space: DisjointAllocationPool::default(),
                owned_code_space: vec![code_space],
                committed_code_space: 0,
                modification_scope_depth: 0,
                is_executable: false,
                #[cfg(test)]
                protection_transition_count: 0,
            }),
        });

        if num_wasm_functions > 0 {
            let mut inner = module.inner.lock().unwrap();
            let jump_table = module.create_empty_jump_table(&mut inner, num_wasm_functions);
            inner.jump_table = Some(jump_table);
        }
        module
    }

    pub fn id(&self) -> CompiledModuleId {
        self.id
    }

    pub fn num_functions(&self) -> u32 {
        self.num_functions
    }

    pub fn num_imported_functions(&self) -> u32 {
        self.num_imported_functions
    }

    pub fn use_trap_handler(&self) -> bool {
        self.use_trap_handler.load(Ordering::Relaxed)
    }

    pub fn set_lazy_compile_frozen(&self, frozen: bool) {
        self.lazy_compile_frozen.store(frozen, Ordering::Relaxed);
    }

    pub fn lazy_compile_frozen(&self) -> bool {
        self.lazy_compile_frozen.load(Ordering::Relaxed)
    }

    /// Add a compiled function body under `index` and publish it: once
    /// this returns, the function's jump-table slot branches to the new
    /// code.
    #[allow(clippy::too_many_arguments)]
    pub fn add_code(
        &self,
        desc: &CodeDesc<'_>,
        frame_slots: u32,
        index: u32,
        safepoint_table_offset: usize,
        handler_table_offset: usize,
        protected_instructions: Vec<ProtectedInstructionData>,
        source_positions: &[u8],
        tier: Tier,
    ) -> Arc<WasmCode> {
        let mut inner = self.inner.lock().unwrap();
        let code = self
            .add_owned_code(
                &mut inner,
                desc.instructions(),
                desc.reloc_info().into(),
                source_positions.into(),
                Some(index),
                CodeKind::Function,
                desc.instr_size - desc.constant_pool_size,
                frame_slots,
                safepoint_table_offset,
                handler_table_offset,
                protected_instructions.into_boxed_slice(),
                tier,
                false,
            )
            .unwrap_or_else(|| {
                panic!("wasm code manager: out of code space adding function {index}")
            });

        self.apply_relocations(&inner, &code, desc.buffer.as_ptr() as usize);

        if self.use_trap_handler.load(Ordering::Relaxed) {
            code.register_trap_handler_data();
        }

        // Publish. The jump-table patch is the linearization point: a
        // caller reading the slot after it calls fully relocated code.
        Self::set_code_locked(&mut inner, self.num_imported_functions, index, code.clone());
        self.patch_jump_table(&inner, index, code.instruction_start(), true);

        // Flushed here rather than in add_owned_code so the relocation
        // writes above are covered.
        mmap::flush_icache(code.instruction_start(), code.instructions().len());
        if cfg!(debug_assertions) {
            self.validate_code(&inner, &code);
        }
        code
    }

    /// Copy already-assembled code, for example a wrapper compiled by a
    /// different pipeline, into this module under `index`.
    pub fn add_code_copy(
        &self,
        code: &ExternalCode<'_>,
        kind: CodeKind,
        index: u32,
    ) -> Arc<WasmCode> {
        let mut inner = self.inner.lock().unwrap();
        let ret = self.add_anonymous_code(&mut inner, code, kind, Some(index));
        if index >= self.num_imported_functions {
            Self::set_code_locked(&mut inner, self.num_imported_functions, index, ret.clone());
        }
        ret
    }

    /// Add an interpreter entry for `index` and redirect the function's
    /// jump-table slot to it. The entry self-identifies as the function
    /// but is not stored in the code table.
    pub fn add_interpreter_entry(&self, code: &ExternalCode<'_>, index: u32) -> Arc<WasmCode> {
        let mut inner = self.inner.lock().unwrap();
        let ret =
            self.add_anonymous_code(&mut inner, code, CodeKind::InterpreterEntry, Some(index));
        self.patch_jump_table(&inner, index, ret.instruction_start(), true);
        ret
    }

    /// Install the lazy-compile stub and point every jump-table slot at
    /// it.
    pub fn set_lazy_builtin(&self, code: &ExternalCode<'_>) {
        let num_wasm_functions = self.num_functions - self.num_imported_functions;
        if num_wasm_functions == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let lazy_builtin = self.add_anonymous_code(&mut inner, code, CodeKind::LazyStub, None);
        let lazy_compile_target = lazy_builtin.instruction_start();

        let jump_table = inner
            .jump_table
            .clone()
            .expect("module with wasm functions has a jump table");
        let mut jtasm = JumpTableAssembler::new(
            jump_table.instruction_start(),
            jump_table.instructions().len(),
        );
        for i in 0..num_wasm_functions {
            debug_assert_eq!(i as usize * JUMP_TABLE_SLOT_SIZE, jtasm.pc_offset());
            jtasm.emit_lazy_compile_jump_slot(self.num_imported_functions + i, lazy_compile_target);
            jtasm.nop_bytes((i as usize + 1) * JUMP_TABLE_SLOT_SIZE - jtasm.pc_offset());
        }
        mmap::flush_icache(
            jump_table.instruction_start(),
            jump_table.instructions().len(),
        );
    }

    /// Copy every runtime stub into this module. Must be called exactly
    /// once, before any code with stub-call relocations is added; stub
    /// ids are resolved against this table during relocation.
    pub fn set_runtime_stubs(&self, stubs: &[ExternalCode<'_>]) {
        assert_eq!(stubs.len(), RUNTIME_STUB_COUNT);
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.runtime_stub_table[0].is_none(),
            "runtime stubs already initialized"
        );
        for (id, stub) in RuntimeStubId::ALL.iter().zip(stubs) {
            let code = self.add_anonymous_code(&mut inner, stub, CodeKind::RuntimeStub, None);
            inner.runtime_stub_table[*id as usize] = Some(code);
        }
    }

    /// The published code for `index`, if any.
    pub fn code(&self, index: u32) -> Option<Arc<WasmCode>> {
        assert_lt!(index, self.num_functions);
        assert_le!(self.num_imported_functions, index);
        let inner = self.inner.lock().unwrap();
        inner.code_table[(index - self.num_imported_functions) as usize].clone()
    }

    pub fn has_code(&self, index: u32) -> bool {
        self.code(index).is_some()
    }

    pub fn runtime_stub(&self, id: RuntimeStubId) -> Arc<WasmCode> {
        let inner = self.inner.lock().unwrap();
        Self::runtime_stub_locked(&inner, id)
    }

    pub fn is_jump_table_slot(&self, address: usize) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .jump_table
            .as_ref()
            .is_some_and(|jt| jt.contains(address))
    }

    /// The target to call for `func_index`: its jump-table slot. One
    /// indirection per call is what makes retiering and lazy compilation
    /// a single-slot patch.
    pub fn get_call_target_for_function(&self, func_index: u32) -> usize {
        let inner = self.inner.lock().unwrap();
        let jump_table = inner
            .jump_table
            .as_ref()
            .expect("module with wasm functions has a jump table");
        let slot_idx = (func_index - self.num_imported_functions) as usize;
        assert_lt!(
            slot_idx,
            jump_table.instructions().len() / JUMP_TABLE_SLOT_SIZE
        );
        jump_table.instruction_start() + slot_idx * JUMP_TABLE_SLOT_SIZE
    }

    /// Inverse of `get_call_target_for_function`; only defined for
    /// addresses within the jump table.
    pub fn get_function_index_from_jump_table_slot(&self, slot_address: usize) -> u32 {
        let inner = self.inner.lock().unwrap();
        let jump_table = inner
            .jump_table
            .as_ref()
            .expect("module with wasm functions has a jump table");
        debug_assert!(jump_table.contains(slot_address));
        let offset = slot_address - jump_table.instruction_start();
        let slot_idx = (offset / JUMP_TABLE_SLOT_SIZE) as u32;
        assert_lt!(slot_idx, self.num_functions - self.num_imported_functions);
        self.num_imported_functions + slot_idx
    }

    /// Find the code blob containing `pc`, if any.
    pub fn lookup(&self, pc: usize) -> Option<Arc<WasmCode>> {
        let inner = self.inner.lock().unwrap();
        Self::lookup_locked(&inner, pc)
    }

    /// Transition this module from trap-handler-based bounds checks to
    /// explicit bounds checks. One-way; all function code must be
    /// recompiled and re-added afterwards. The replaced code stays in the
    /// arena until the module dies.
    pub fn disable_trap_handler(&self) {
        debug_assert!(self.use_trap_handler.load(Ordering::Relaxed));
        self.use_trap_handler.store(false, Ordering::Relaxed);

        // Clear the code table so a missed re-add is caught early.
        let mut inner = self.inner.lock().unwrap();
        for slot in inner.code_table.iter_mut() {
            *slot = None;
        }
    }

    /// Flip the module's committed ranges between read-execute and
    /// read-write. Idempotent.
    pub fn set_executable(&self, executable: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        self.set_executable_locked(&mut inner, executable)
    }

    pub(crate) fn committed_code_space(&self) -> usize {
        self.inner.lock().unwrap().committed_code_space
    }

    fn set_executable_locked(&self, inner: &mut ModuleInner, executable: bool) -> Result<()> {
        if inner.is_executable == executable {
            return Ok(());
        }
        log::trace!("module {:?}: set executable: {executable}", self.id);
        let permission = if executable {
            Permission::ReadExecute
        } else {
            Permission::ReadWrite
        };

        if self.manager.config().write_protect_code_memory {
            if cfg!(windows) && self.can_request_more_memory {
                // Growable modules on windows flip permissions at
                // reservation granularity; their pages were committed at
                // the same granularity.
                for vmem in &inner.owned_code_space {
                    mmap::set_permissions(vmem.address(), vmem.size(), permission)
                        .with_context(|| format!("module {:?}: set_executable", self.id))?;
                }
            } else {
                let page_size = mmap::page_size();
                for range in inner.allocated_code_space.ranges() {
                    // Allocated ranges are code-aligned, not page-aligned.
                    let size = round_up(range.size(), page_size);
                    mmap::set_permissions(range.start, size, permission)
                        .with_context(|| format!("module {:?}: set_executable", self.id))?;
                }
            }
        }
        inner.is_executable = executable;
        #[cfg(test)]
        {
            inner.protection_transition_count += 1;
        }
        Ok(())
    }

    /// Primitive for adding code to the module: allocates arena space,
    /// copies the instruction bytes, and inserts the descriptor into the
    /// address-ordered code list. Returns `None` when the committed-space
    /// budget is exhausted.
    #[allow(clippy::too_many_arguments)]
    fn add_owned_code(
        &self,
        inner: &mut ModuleInner,
        instructions: &[u8],
        reloc_info: Box<[u8]>,
        source_positions: Box<[u8]>,
        index: Option<u32>,
        kind: CodeKind,
        constant_pool_offset: usize,
        stack_slots: u32,
        safepoint_table_offset: usize,
        handler_table_offset: usize,
        protected_instructions: Box<[ProtectedInstructionData]>,
        tier: Tier,
        flush_icache: bool,
    ) -> Option<Arc<WasmCode>> {
        debug_assert!(!instructions.is_empty());
        let start = self.allocate_for_code(inner, instructions.len())?;
        unsafe {
            ptr::copy_nonoverlapping(instructions.as_ptr(), start as *mut u8, instructions.len());
        }

        let constant_pool_offset = self
            .manager
            .config()
            .enable_embedded_constant_pool
            .then_some(constant_pool_offset);
        let code = Arc::new(WasmCode::new(
            start,
            instructions.len(),
            reloc_info,
            source_positions,
            self.id,
            index,
            kind,
            constant_pool_offset,
            stack_slots,
            safepoint_table_offset,
            handler_table_offset,
            protected_instructions,
            tier,
        ));

        let insert_at = inner
            .owned_code
            .partition_point(|c| c.instruction_start() <= start);
        inner.owned_code.insert(insert_at, code.clone());

        if flush_icache {
            mmap::flush_icache(start, instructions.len());
        }
        Some(code)
    }

    /// Copy external code into the arena and relocate it in place.
    fn add_anonymous_code(
        &self,
        inner: &mut ModuleInner,
        code: &ExternalCode<'_>,
        kind: CodeKind,
        index: Option<u32>,
    ) -> Arc<WasmCode> {
        let ret = self
            .add_owned_code(
                inner,
                code.instructions,
                code.reloc_info.into(),
                code.source_positions.into(),
                index,
                kind,
                code.constant_pool_offset,
                code.stack_slots,
                code.safepoint_table_offset,
                code.handler_table_offset,
                Box::new([]),
                Tier::Other,
                false,
            )
            .unwrap_or_else(|| {
                panic!(
                    "wasm code manager: out of code space adding {} code",
                    kind.as_str()
                )
            });

        self.apply_relocations(inner, &ret, code.instructions.as_ptr() as usize);

        // Flushed here rather than in add_owned_code so the relocation
        // writes above are covered.
        mmap::flush_icache(ret.instruction_start(), ret.instructions().len());
        if cfg!(debug_assertions) {
            self.validate_code(inner, &ret);
        }
        ret
    }

    /// Resolve stub calls against the stub table and shift every
    /// delta-relocatable slot by the distance the code moved from
    /// `original_start`.
    fn apply_relocations(&self, inner: &ModuleInner, code: &WasmCode, original_start: usize) {
        let delta = code.instruction_start() as isize - original_start as isize;
        let mask = RelocModeMask::apply_mask().with(RelocMode::WasmStubCall);
        for entry in RelocIterator::new(
            code.instruction_start(),
            code.instructions().len(),
            code.reloc_info(),
            mask,
        ) {
            if entry.mode() == RelocMode::WasmStubCall {
                let tag = entry.wasm_stub_call_tag();
                let id = RuntimeStubId::from_tag(tag)
                    .unwrap_or_else(|| panic!("invalid runtime stub tag {tag}"));
                let stub = Self::runtime_stub_locked(inner, id);
                entry.set_wasm_stub_call_address(stub.instruction_start());
            } else {
                entry.apply(delta);
            }
        }
    }

    fn create_empty_jump_table(
        &self,
        inner: &mut ModuleInner,
        num_wasm_functions: u32,
    ) -> Arc<WasmCode> {
        debug_assert!(num_wasm_functions > 0);
        let jump_table_size = num_wasm_functions as usize * JUMP_TABLE_SLOT_SIZE;
        let instructions = vec![0u8; jump_table_size];
        self.add_owned_code(
            inner,
            &instructions,
            Box::new([]),
            Box::new([]),
            None,
            CodeKind::JumpTable,
            0,
            0,
            0,
            0,
            Box::new([]),
            Tier::Other,
            false,
        )
        .unwrap_or_else(|| panic!("wasm code manager: out of code space creating jump table"))
    }

    fn patch_jump_table(&self, inner: &ModuleInner, func_index: u32, target: usize, flush: bool) {
        assert_le!(self.num_imported_functions, func_index);
        let slot_idx = (func_index - self.num_imported_functions) as usize;
        let jump_table = inner
            .jump_table
            .as_ref()
            .expect("module with wasm functions has a jump table");
        let slot = jump_table.instruction_start() + slot_idx * JUMP_TABLE_SLOT_SIZE;
        JumpTableAssembler::patch_jump_table_slot(slot, target, flush);
    }

    /// Carve `size` bytes out of the free pool, growing the reservation
    /// set if permitted, and commit any not-yet-committed pages the carve
    /// spans.
    fn allocate_for_code(&self, inner: &mut ModuleInner, size: usize) -> Option<usize> {
        // Callers hold the allocation lock.
        let size = round_up(size, CODE_ALIGNMENT);
        let mut mem = inner.free_code_space.allocate(size);
        if mem.is_empty() {
            if !self.can_request_more_memory {
                return None;
            }

            let hint = inner.owned_code_space.last().map(|vmem| vmem.end());
            let new_mem = self.manager.try_allocate(size, hint)?;
            self.manager
                .assign_range(new_mem.address(), new_mem.end(), self.me.clone());
            inner
                .free_code_space
                .merge(AddressRange::new(new_mem.address(), new_mem.end()));
            inner.owned_code_space.push(new_mem);
            mem = inner.free_code_space.allocate(size);
            if mem.is_empty() {
                return None;
            }
        }

        // `commit_start` is either `mem.start` or the start of the next
        // page: everything below it was committed by earlier allocations,
        // because allocation bumps upwards and reservations are
        // page-aligned.
        let page_size = mmap::page_size();
        let commit_start = round_up(mem.start, page_size);
        #[cfg_attr(not(windows), allow(unused_mut))]
        let mut commit_end = round_up(mem.end, page_size);
        if commit_start < commit_end {
            #[cfg(windows)]
            {
                // Windows cannot commit a range straddling separate
                // reservations. Allocation bumps upwards and new
                // reservations append, so walking the reservations in
                // reverse chunks the commit correctly.
                for vmem in inner.owned_code_space.iter().rev() {
                    if commit_end > vmem.end() || vmem.address() >= commit_end {
                        continue;
                    }
                    let start = commit_start.max(vmem.address());
                    let commit_size = commit_end - start;
                    debug_assert_eq!(commit_size % page_size, 0);
                    if !self.manager.commit(start, commit_size) {
                        return None;
                    }
                    inner.committed_code_space += commit_size;
                    commit_end = start;
                    if commit_start >= commit_end {
                        break;
                    }
                }
            }
            #[cfg(not(windows))]
            {
                let commit_size = commit_end - commit_start;
                debug_assert_eq!(commit_size % page_size, 0);
                if !self.manager.commit(commit_start, commit_size) {
                    return None;
                }
                inner.committed_code_space += commit_size;
            }
        }

        debug_assert_eq!(mem.start % CODE_ALIGNMENT, 0);
        let start = mem.start;
        inner.allocated_code_space.merge(mem);
        log::trace!("module {:?}: code alloc {start:#x},+{size:#x}", self.id);
        Some(start)
    }

    fn set_code_locked(
        inner: &mut ModuleInner,
        num_imported_functions: u32,
        index: u32,
        code: Arc<WasmCode>,
    ) {
        assert_le!(num_imported_functions, index);
        debug_assert_eq!(code.index(), index);
        inner.code_table[(index - num_imported_functions) as usize] = Some(code);
    }

    fn runtime_stub_locked(inner: &ModuleInner, id: RuntimeStubId) -> Arc<WasmCode> {
        inner.runtime_stub_table[id as usize]
            .clone()
            .expect("runtime stubs are initialized before stub calls are resolved")
    }

    fn lookup_locked(inner: &ModuleInner, pc: usize) -> Option<Arc<WasmCode>> {
        let idx = inner
            .owned_code
            .partition_point(|c| c.instruction_start() <= pc);
        if idx == 0 {
            return None;
        }
        let candidate = &inner.owned_code[idx - 1];
        candidate.contains(pc).then(|| candidate.clone())
    }

    /// Debug-only check of a freshly added code blob: only permitted
    /// relocation modes appear, and every stub call resolves to the start
    /// of a runtime stub in this module.
    fn validate_code(&self, inner: &ModuleInner, code: &WasmCode) {
        for entry in RelocIterator::new(
            code.instruction_start(),
            code.instructions().len(),
            code.reloc_info(),
            RelocModeMask::ALL,
        ) {
            if entry.mode() == RelocMode::WasmStubCall {
                let target = entry.target_address();
                let stub = Self::lookup_locked(inner, target)
                    .expect("stub call targets code in this module");
                assert_eq!(stub.kind(), CodeKind::RuntimeStub);
                assert_eq!(target, stub.instruction_start());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_executable(&self) -> bool {
        self.inner.lock().unwrap().is_executable
    }

    #[cfg(test)]
    pub(crate) fn protection_transition_count(&self) -> usize {
        self.inner.lock().unwrap().protection_transition_count
    }
}

impl Drop for NativeModule {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let reservations = std::mem::take(&mut inner.owned_code_space);
        let committed = inner.committed_code_space;
        // The remaining members (and with them the trap-handler
        // registrations of the owned code) are dropped after the
        // reservations have been returned.
        self.manager
            .free_native_module(self.id, reservations, committed);
    }
}

/// Within the scope the module's code space is writable; at the
/// outermost scope exit it becomes executable again, regardless of the
/// module's state when the scope was entered. Scopes nest; only the
/// outermost entry and exit change permissions.
pub struct NativeModuleModificationScope<'a> {
    native_module: &'a NativeModule,
}

impl<'a> NativeModuleModificationScope<'a> {
    pub fn new(native_module: &'a NativeModule) -> Self {
        let mut inner = native_module.inner.lock().unwrap();
        inner.modification_scope_depth += 1;
        if inner.modification_scope_depth == 1 {
            native_module
                .set_executable_locked(&mut inner, false)
                .unwrap_or_else(|e| panic!("failed to make code space writable: {e:#}"));
        }
        Self { native_module }
    }
}

impl Drop for NativeModuleModificationScope<'_> {
    fn drop(&mut self) {
        let mut inner = self.native_module.inner.lock().unwrap();
        inner.modification_scope_depth -= 1;
        if inner.modification_scope_depth == 0 {
            self.native_module
                .set_executable_locked(&mut inner, true)
                .unwrap_or_else(|e| panic!("failed to make code space executable: {e:#}"));
        }
    }
}
