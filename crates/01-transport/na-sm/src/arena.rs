//! Generational arena handing out index handles instead of pointers.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> Arena<T> {
    pub fn insert(&mut self, value: T) -> (Handle, Arc<T>) {
        let value = Arc::new(value);
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(Arc::clone(&value));
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(Arc::clone(&value)),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        (Handle { index, generation }, value)
    }

    pub fn get(&self, handle: Handle) -> Option<&Arc<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Removes the value; stale handles to the slot stop resolving.
    pub fn remove(&mut self, handle: Handle) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_handles_go_stale() {
        let mut arena = Arena::default();
        let (a, _) = arena.insert("a");
        let (b, _) = arena.insert("b");
        assert_eq!(arena.remove(a).as_deref(), Some(&"a"));
        assert!(arena.get(a).is_none());

        let (c, _) = arena.insert("c");
        assert_eq!(c.index(), a.index(), "slot is reused");
        assert_ne!(c.generation(), a.generation());
        assert!(arena.get(a).is_none(), "stale handle must not see the new value");
        assert_eq!(arena.get(c).map(|v| **v), Some("c"));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(b).map(|v| **v), Some("b"));
    }
}
