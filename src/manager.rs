//! Process-wide management of wasm code space: reservation, commit
//! accounting against a global budget, and PC→module lookup.

use crate::code::{CompiledModuleId, CompiledModuleIdAllocator, WasmCode};
use crate::jump_table::JUMP_TABLE_SLOT_SIZE;
use crate::mmap::{self, Permission, VirtualMemory};
use crate::module::NativeModule;
use more_asserts::assert_le;
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Upper bound on code space a single manager will ever commit; also the
/// reservation size on targets that require contiguous code.
pub const MAX_WASM_CODE_MEMORY: usize = 256 * 1024 * 1024;

/// When the uncommitted budget drops below this with more than one live
/// module, the next module creation raises the critical memory-pressure
/// callback.
const CRITICAL_THRESHOLD: usize = 32 * 1024 * 1024;

const CODE_SIZE_MULTIPLIER: usize = 4;
const IMPORT_SIZE: usize = 32 * mem::size_of::<usize>();

/// On 64-bit targets each module reserves its maximal contiguous range up
/// front and never grows; on 32-bit targets address space is the scarce
/// resource, so modules reserve an estimate and request more on demand.
const MODULE_CAN_ALLOCATE_MORE_MEMORY: bool = cfg!(target_pointer_width = "32");
const REQUIRES_CODE_RANGE: bool = cfg!(target_pointer_width = "64");

/// Configuration of a `WasmCodeManager`.
#[derive(Clone, Debug)]
pub struct CodeManagerConfig {
    /// Process-wide cap on committed code bytes.
    pub max_committed: usize,
    /// Keep code pages write-xor-execute, flipping protections around
    /// modification. When off, arenas stay read-write-execute.
    pub write_protect_code_memory: bool,
    /// Expose the embedded constant pool offset of code descriptors.
    pub enable_embedded_constant_pool: bool,
}

impl Default for CodeManagerConfig {
    fn default() -> Self {
        Self {
            max_committed: MAX_WASM_CODE_MEMORY,
            write_protect_code_memory: false,
            enable_embedded_constant_pool: false,
        }
    }
}

/// Per-module parameters supplied by the translation front-end.
#[derive(Clone, Debug)]
pub struct ModuleEnv {
    pub num_functions: u32,
    pub num_imported_functions: u32,
    /// Compile with trap-handler-based bounds checks.
    pub use_trap_handler: bool,
    /// Total size in bytes of the module's function bodies; input to the
    /// code-space estimate.
    pub code_size: usize,
}

/// Shared, process-wide owner of code-space policy: reserves address
/// space for modules, accounts committed bytes against `max_committed`,
/// and maps PCs back to the module (and code) containing them.
pub struct WasmCodeManager {
    config: CodeManagerConfig,
    /// Reservation start → (reservation end, owning module). Every
    /// reservation of every live module has exactly one entry.
    lookup_map: Mutex<BTreeMap<usize, (usize, Weak<NativeModule>)>>,
    /// Count of live modules; drives the memory-pressure heuristic.
    active: AtomicUsize,
    remaining_uncommitted_code_space: AtomicUsize,
    id_allocator: CompiledModuleIdAllocator,
    memory_pressure_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl WasmCodeManager {
    pub fn new(config: CodeManagerConfig) -> Arc<WasmCodeManager> {
        assert_le!(config.max_committed, MAX_WASM_CODE_MEMORY);
        Arc::new(WasmCodeManager {
            remaining_uncommitted_code_space: AtomicUsize::new(config.max_committed),
            config,
            lookup_map: Mutex::new(BTreeMap::new()),
            active: AtomicUsize::new(0),
            id_allocator: CompiledModuleIdAllocator::new(),
            memory_pressure_callback: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CodeManagerConfig {
        &self.config
    }

    /// Install the hook raised when the uncommitted budget runs
    /// critically low while multiple modules are live.
    pub fn set_memory_pressure_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.memory_pressure_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Create a new native module with a reservation sized by the
    /// estimator.
    pub fn new_native_module(self: &Arc<Self>, env: &ModuleEnv) -> Arc<NativeModule> {
        let memory_estimate = Self::estimate_native_module_size(env);
        self.new_native_module_with_params(env, memory_estimate, MODULE_CAN_ALLOCATE_MORE_MEMORY)
    }

    /// Create a new native module. The reservation is page aligned; when
    /// the target requires contiguous code the maximal range is reserved
    /// up front and `memory_estimate` is ignored.
    pub fn new_native_module_with_params(
        self: &Arc<Self>,
        env: &ModuleEnv,
        memory_estimate: usize,
        can_request_more: bool,
    ) -> Arc<NativeModule> {
        // Surface memory pressure before the new reservation when the
        // budget is nearly gone and more than one module is competing.
        if self.active.load(Ordering::SeqCst) > 1
            && self.remaining_uncommitted_code_space.load(Ordering::SeqCst) < CRITICAL_THRESHOLD
        {
            if let Some(callback) = &*self.memory_pressure_callback.lock().unwrap() {
                callback();
            }
        }

        let vmem_size = if REQUIRES_CODE_RANGE {
            MAX_WASM_CODE_MEMORY
        } else {
            memory_estimate
        };
        let mem = self.try_allocate(vmem_size, None).unwrap_or_else(|| {
            panic!("wasm code manager: failed to reserve {vmem_size:#x} bytes of code space")
        });
        self.install_module(env, can_request_more, mem)
    }

    #[cfg(test)]
    pub(crate) fn new_native_module_for_testing(
        self: &Arc<Self>,
        env: &ModuleEnv,
        reservation_size: usize,
        can_request_more: bool,
    ) -> Arc<NativeModule> {
        let mem = self
            .try_allocate(reservation_size, None)
            .expect("failed to reserve test code space");
        self.install_module(env, can_request_more, mem)
    }

    fn install_module(
        self: &Arc<Self>,
        env: &ModuleEnv,
        can_request_more: bool,
        mem: VirtualMemory,
    ) -> Arc<NativeModule> {
        let (start, size, end) = (mem.address(), mem.size(), mem.end());
        let module =
            NativeModule::new(self.id_allocator.alloc(), env, can_request_more, mem, self.clone());
        log::trace!("new module {:?}: mem {start:#x},+{size:#x}", module.id());
        self.assign_range(start, end, Arc::downgrade(&module));
        self.active.fetch_add(1, Ordering::SeqCst);
        module
    }

    /// Size heuristic for a fresh module's code reservation.
    pub fn estimate_native_module_size(env: &ModuleEnv) -> usize {
        let num_wasm_functions = (env.num_functions - env.num_imported_functions) as usize;
        mmap::page_size()
            + mem::size_of::<NativeModule>()
            + num_wasm_functions * mem::size_of::<*const ()>()
            + num_wasm_functions * mem::size_of::<WasmCode>()
            + env.num_imported_functions as usize * IMPORT_SIZE
            + num_wasm_functions * JUMP_TABLE_SLOT_SIZE
            + CODE_SIZE_MULTIPLIER * env.code_size
    }

    /// Reserve a page-aligned region of at least `size` bytes, preferably
    /// at `hint`.
    pub(crate) fn try_allocate(&self, size: usize, hint: Option<usize>) -> Option<VirtualMemory> {
        debug_assert!(size > 0);
        let size = mmap::round_up_to_page(size);
        match VirtualMemory::reserve(size, hint) {
            Ok(mem) => {
                log::trace!("vmem reserve: {:#x},+{:#x}", mem.address(), mem.size());
                Some(mem)
            }
            Err(e) => {
                log::trace!("vmem reserve of {size:#x} bytes failed: {e:#}");
                None
            }
        }
    }

    pub(crate) fn assign_range(&self, start: usize, end: usize, module: Weak<NativeModule>) {
        self.lookup_map
            .lock()
            .unwrap()
            .insert(start, (end, module));
    }

    /// Debit `size` bytes from the uncommitted budget and back the pages.
    /// Returns false, leaving the budget untouched, when the budget
    /// cannot cover the commit.
    pub(crate) fn commit(&self, start: usize, size: usize) -> bool {
        debug_assert_eq!(start % mmap::page_size(), 0);
        debug_assert_eq!(size % mmap::page_size(), 0);

        // CAS loop: a plain subtract could drive the counter through
        // zero and let concurrent compile threads over-commit.
        let mut old = self.remaining_uncommitted_code_space.load(Ordering::SeqCst);
        loop {
            if old < size {
                return false;
            }
            match self.remaining_uncommitted_code_space.compare_exchange_weak(
                old,
                old - size,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => old = current,
            }
        }

        let permission = if self.config.write_protect_code_memory {
            Permission::ReadWrite
        } else {
            Permission::ReadWriteExecute
        };
        log::trace!("commit {start:#x},+{size:#x} as {permission:?}");
        if let Err(e) = mmap::commit_pages(start, size, permission) {
            log::trace!("commit failed: {e:#}");
            self.remaining_uncommitted_code_space
                .fetch_add(size, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub(crate) fn free_native_module(
        &self,
        id: CompiledModuleId,
        reservations: Vec<VirtualMemory>,
        committed: usize,
    ) {
        debug_assert!(self.active.load(Ordering::SeqCst) >= 1);
        self.active.fetch_sub(1, Ordering::SeqCst);
        log::trace!("freeing module {id:?}");

        let mut map = self.lookup_map.lock().unwrap();
        for vmem in &reservations {
            map.remove(&vmem.address());
            log::trace!("vmem release: {:#x},+{:#x}", vmem.address(), vmem.size());
        }
        drop(map);
        drop(reservations);

        debug_assert_eq!(committed % mmap::page_size(), 0);
        self.remaining_uncommitted_code_space
            .fetch_add(committed, Ordering::SeqCst);
    }

    /// Find the module whose reservations contain `pc`.
    pub fn lookup_native_module(&self, pc: usize) -> Option<Arc<NativeModule>> {
        let map = self.lookup_map.lock().unwrap();
        let (start, (end, module)) = map.range(..=pc).next_back()?;
        if *start <= pc && pc < *end {
            module.upgrade()
        } else {
            None
        }
    }

    /// Find the code blob containing `pc` across all live modules.
    pub fn lookup_code(&self, pc: usize) -> Option<Arc<WasmCode>> {
        self.lookup_native_module(pc)
            .and_then(|module| module.lookup(pc))
    }

    /// Specialized lookup for callers that already know `pc` is the first
    /// instruction of some code blob.
    pub fn get_code_from_start_address(&self, pc: usize) -> Arc<WasmCode> {
        let code = self
            .lookup_code(pc)
            .expect("no code registered at start address");
        debug_assert_eq!(pc, code.instruction_start());
        code
    }

    pub fn remaining_uncommitted_code_space(&self) -> usize {
        self.remaining_uncommitted_code_space.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeKind, ExternalCode};
    use crate::mmap::round_up_to_page;
    use std::sync::atomic::AtomicUsize;

    const MIB: usize = 1024 * 1024;

    fn manager_with_budget(max_committed: usize) -> Arc<WasmCodeManager> {
        let _ = env_logger::builder().is_test(true).try_init();
        WasmCodeManager::new(CodeManagerConfig {
            max_committed,
            write_protect_code_memory: true,
            enable_embedded_constant_pool: false,
        })
    }

    fn wrapper_env() -> ModuleEnv {
        // One imported function, no wasm functions: no jump table, so
        // nothing is committed at module creation.
        ModuleEnv {
            num_functions: 1,
            num_imported_functions: 1,
            use_trap_handler: false,
            code_size: 0,
        }
    }

    #[test]
    fn commit_accounting_roundtrip() {
        let manager = manager_with_budget(MIB);
        let module = manager.new_native_module(&wrapper_env());
        assert_eq!(manager.remaining_uncommitted_code_space(), MIB);

        let instructions = vec![0xC3u8; 600 * 1024];
        let code = module.add_code_copy(
            &ExternalCode::from_instructions(&instructions),
            CodeKind::WasmToJsWrapper,
            0,
        );
        let rounded = round_up_to_page(instructions.len());
        assert_eq!(
            manager.remaining_uncommitted_code_space(),
            MIB - rounded
        );
        assert_eq!(module.committed_code_space(), rounded);

        drop(code);
        drop(module);
        assert_eq!(manager.remaining_uncommitted_code_space(), MIB);
    }

    #[test]
    fn committed_plus_remaining_is_the_budget() {
        let manager = manager_with_budget(MIB);
        let a = manager.new_native_module(&wrapper_env());
        let b = manager.new_native_module(&wrapper_env());
        let blob = vec![0xC3u8; 24 * 1024];
        a.add_code_copy(
            &ExternalCode::from_instructions(&blob),
            CodeKind::WasmToJsWrapper,
            0,
        );
        b.add_code_copy(
            &ExternalCode::from_instructions(&blob[..8 * 1024]),
            CodeKind::WasmToJsWrapper,
            0,
        );

        assert_eq!(
            a.committed_code_space()
                + b.committed_code_space()
                + manager.remaining_uncommitted_code_space(),
            MIB
        );
    }

    #[test]
    fn commit_refuses_to_exceed_the_budget() {
        let page = mmap::page_size();
        let manager = manager_with_budget(page);
        let mem = VirtualMemory::reserve(2 * page, None).unwrap();

        assert!(!manager.commit(mem.address(), 2 * page));
        assert_eq!(manager.remaining_uncommitted_code_space(), page);

        assert!(manager.commit(mem.address(), page));
        assert_eq!(manager.remaining_uncommitted_code_space(), 0);

        assert!(!manager.commit(mem.address() + page, page));
    }

    #[test]
    fn lookup_resolves_pc_to_module_and_code() {
        let manager = manager_with_budget(MIB);
        let module_a = manager.new_native_module(&wrapper_env());
        let module_b = manager.new_native_module(&wrapper_env());

        let a = module_a.add_code_copy(
            &ExternalCode::from_instructions(&[0xC3u8; 16]),
            CodeKind::WasmToJsWrapper,
            0,
        );
        let b = module_b.add_code_copy(
            &ExternalCode::from_instructions(&[0xC3u8; 16]),
            CodeKind::WasmToJsWrapper,
            0,
        );

        let found_a = manager.lookup_code(a.instruction_start() + 8).unwrap();
        assert_eq!(found_a.instruction_start(), a.instruction_start());
        assert_eq!(found_a.module_id(), module_a.id());

        let found_b = manager
            .get_code_from_start_address(b.instruction_start());
        assert_eq!(found_b.module_id(), module_b.id());

        // Inside a reservation but outside any code.
        assert!(manager
            .lookup_code(a.instruction_start() + 64 * 1024)
            .is_none());
        // Outside every reservation.
        assert!(manager.lookup_native_module(1).is_none());

        let a_start = a.instruction_start();
        drop(a);
        drop(module_a);
        assert!(manager.lookup_code(a_start).is_none());
        assert!(manager.lookup_code(b.instruction_start()).is_some());
    }

    #[test]
    fn critical_memory_pressure_fires_on_module_creation() {
        let manager = manager_with_budget(MIB);
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        manager.set_memory_pressure_callback(move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });

        // The budget is below the critical threshold from the start, so
        // the callback fires as soon as more than one module is live.
        let _m1 = manager.new_native_module(&wrapper_env());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let _m2 = manager.new_native_module(&wrapper_env());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let _m3 = manager.new_native_module(&wrapper_env());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn estimate_grows_with_module_size() {
        let small = WasmCodeManager::estimate_native_module_size(&ModuleEnv {
            num_functions: 2,
            num_imported_functions: 1,
            use_trap_handler: false,
            code_size: 100,
        });
        let more_code = WasmCodeManager::estimate_native_module_size(&ModuleEnv {
            num_functions: 2,
            num_imported_functions: 1,
            use_trap_handler: false,
            code_size: 1000,
        });
        let more_functions = WasmCodeManager::estimate_native_module_size(&ModuleEnv {
            num_functions: 20,
            num_imported_functions: 1,
            use_trap_handler: false,
            code_size: 100,
        });
        assert!(small < more_code);
        assert!(small < more_functions);
        assert_eq!(more_code - small, CODE_SIZE_MULTIPLIER * 900);
    }

    #[test]
    fn growable_module_requests_more_code_space() {
        let page = mmap::page_size();
        let manager = manager_with_budget(MIB);
        let module = manager.new_native_module_for_testing(&wrapper_env(), page, true);

        let small = module.add_code_copy(
            &ExternalCode::from_instructions(&[0xC3u8; 16]),
            CodeKind::WasmToJsWrapper,
            0,
        );

        // Larger than the remaining reservation: forces a second one.
        let big_blob = vec![0xC3u8; 2 * page];
        let big = module.add_code_copy(
            &ExternalCode::from_instructions(&big_blob),
            CodeKind::WasmToJsWrapper,
            0,
        );

        // Both blobs resolve through the manager, whichever reservation
        // they landed in.
        assert_eq!(
            manager
                .lookup_code(small.instruction_start())
                .unwrap()
                .instruction_start(),
            small.instruction_start()
        );
        assert_eq!(
            manager
                .lookup_code(big.instruction_start() + page)
                .unwrap()
                .instruction_start(),
            big.instruction_start()
        );
        assert!(module.committed_code_space() >= 3 * page);
    }
}
