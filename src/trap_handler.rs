//! Process-global registration of protected-instruction metadata.
//!
//! Function code compiled for trap-handler-based bounds checking
//! registers its protected instructions here. The process signal handler
//! consults the table to decide whether a faulting PC belongs to wasm
//! code and, if so, where execution resumes.

use crate::code::ProtectedInstructionData;
use lazy_static::lazy_static;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

lazy_static! {
    static ref REGISTRY: RwLock<TrapHandlerRegistry> =
        RwLock::new(TrapHandlerRegistry::default());
}

#[derive(Error, Debug)]
pub enum TrapHandlerError {
    #[error("code region {start:#x},+{size:#x} overlaps an already registered region")]
    Overlap { start: usize, size: usize },
}

struct HandlerData {
    base: usize,
    size: usize,
    protected: Box<[ProtectedInstructionData]>,
}

#[derive(Default)]
struct TrapHandlerRegistry {
    /// Slab of registered entries; the vector index is the handle handed
    /// back to the code descriptor.
    entries: Vec<Option<HandlerData>>,
    free: Vec<usize>,
    /// Region end address → slab index, for faulting-PC lookup.
    by_end: BTreeMap<usize, usize>,
}

impl TrapHandlerRegistry {
    fn register(
        &mut self,
        base: usize,
        size: usize,
        protected: &[ProtectedInstructionData],
    ) -> Result<usize, TrapHandlerError> {
        // The first region ending beyond `base` is the only candidate for
        // an overlap.
        if let Some((_, &existing)) = self.by_end.range(base + 1..).next() {
            let data = self.entries[existing]
                .as_ref()
                .expect("indexed trap handler entry is live");
            if data.base < base + size {
                return Err(TrapHandlerError::Overlap { start: base, size });
            }
        }

        let data = HandlerData {
            base,
            size,
            protected: protected.into(),
        };
        let index = match self.free.pop() {
            Some(index) => {
                debug_assert!(self.entries[index].is_none());
                self.entries[index] = Some(data);
                index
            }
            None => {
                self.entries.push(Some(data));
                self.entries.len() - 1
            }
        };
        self.by_end.insert(base + size, index);
        Ok(index)
    }

    fn release(&mut self, index: usize) {
        let data = self.entries[index]
            .take()
            .expect("released trap handler index is live");
        self.by_end.remove(&(data.base + data.size));
        self.free.push(index);
    }

    fn landing_pad(&self, pc: usize) -> Option<usize> {
        let (_, &index) = self.by_end.range(pc + 1..).next()?;
        let data = self.entries[index].as_ref()?;
        if pc < data.base || pc >= data.base + data.size {
            return None;
        }
        let offset = (pc - data.base) as u32;
        self.protected_landing(data, offset)
    }

    fn protected_landing(&self, data: &HandlerData, offset: u32) -> Option<usize> {
        data.protected
            .iter()
            .find(|p| p.instr_offset == offset)
            .map(|p| data.base + p.landing_offset as usize)
    }
}

/// Register the protected instructions of the code blob at
/// `[base, base + size)`. Returns the handle to release the registration
/// with.
pub fn register_handler_data(
    base: usize,
    size: usize,
    protected: &[ProtectedInstructionData],
) -> Result<usize, TrapHandlerError> {
    REGISTRY
        .write()
        .expect("trap handler registry lock got poisoned")
        .register(base, size, protected)
}

/// Drop the registration previously returned by `register_handler_data`.
pub fn release_handler_data(index: usize) {
    REGISTRY
        .write()
        .expect("trap handler registry lock got poisoned")
        .release(index);
}

/// If `pc` is a registered protected instruction, the address execution
/// continues at after the trap handler intercepts the fault.
pub fn landing_pad_for(pc: usize) -> Option<usize> {
    REGISTRY
        .read()
        .expect("trap handler registry lock got poisoned")
        .landing_pad(pc)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Addresses in these tests never collide with real registrations from
    // other tests because each base is taken from a stack-local array.
    fn unique_base(storage: &[u8; 64]) -> usize {
        storage.as_ptr() as usize
    }

    #[test]
    fn register_lookup_release() {
        let storage = [0u8; 64];
        let base = unique_base(&storage);
        let protected = [
            ProtectedInstructionData {
                instr_offset: 4,
                landing_offset: 16,
            },
            ProtectedInstructionData {
                instr_offset: 20,
                landing_offset: 32,
            },
        ];

        let index = register_handler_data(base, 64, &protected).unwrap();

        assert_eq!(landing_pad_for(base + 4), Some(base + 16));
        assert_eq!(landing_pad_for(base + 20), Some(base + 32));
        // In range but not a protected instruction.
        assert_eq!(landing_pad_for(base + 8), None);
        // Out of range.
        assert_eq!(landing_pad_for(base + 64), None);

        release_handler_data(index);
        assert_eq!(landing_pad_for(base + 4), None);
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let storage = [0u8; 64];
        let base = unique_base(&storage);

        let index = register_handler_data(base, 64, &[]).unwrap();
        assert!(matches!(
            register_handler_data(base + 16, 16, &[]),
            Err(TrapHandlerError::Overlap { .. })
        ));
        release_handler_data(index);
    }

    #[test]
    fn handles_are_recycled() {
        // Exercised on a local registry; the process-global one is shared
        // with concurrently running tests.
        let mut registry = TrapHandlerRegistry::default();
        let a = registry.register(0x1000, 64, &[]).unwrap();
        let b = registry.register(0x2000, 64, &[]).unwrap();
        registry.release(a);
        let c = registry.register(0x3000, 64, &[]).unwrap();
        assert_eq!(a, c);
        registry.release(b);
        registry.release(c);
    }
}
