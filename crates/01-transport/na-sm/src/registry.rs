use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{NaError, NaResult};

/// Process-wide source of endpoint instance ids.
///
/// Every endpoint opened in a process gets the next id; ids are never reused
/// and at most 256 endpoints may be opened per registry. Tests create their
/// own registry, applications normally share [`ProcessRegistry::global`].
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    next_id: AtomicU32,
}

static GLOBAL: ProcessRegistry = ProcessRegistry::new();

impl ProcessRegistry {
    pub const fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
        }
    }

    pub fn global() -> &'static ProcessRegistry {
        &GLOBAL
    }

    pub fn next_instance_id(&self) -> NaResult<u8> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        u8::try_from(id).map_err(|_| NaError::Overflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_and_bounded() {
        let registry = ProcessRegistry::new();
        for expected in 0..=255u8 {
            assert_eq!(registry.next_instance_id().unwrap(), expected);
        }
        assert_eq!(registry.next_instance_id(), Err(NaError::Overflow));
    }
}
