//! Generational arena backing the foreign-object table.

use std::fmt;

/// Key into an [`ObjectHeap`].
///
/// Small enough to be copied into a foreign instance's raw storage. The
/// generation detects keys that outlived the entry they were issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ForeignToken {
    pub index: u32,
    pub generation: u32,
}

impl ForeignToken {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// Slot storage with generational indices.
///
/// Removing an entry bumps its slot's generation and puts the slot on the free
/// list, so a token issued for the old entry never resolves to the new one.
pub struct ObjectHeap<T> {
    slots: Vec<HeapSlot<T>>,
    free_list: Vec<u32>,
    live: usize,
}

struct HeapSlot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> ObjectHeap<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> ForeignToken {
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            ForeignToken::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(HeapSlot {
                generation: 0,
                value: Some(value),
            });
            ForeignToken::new(index, 0)
        }
    }

    /// Returns None if the token is stale.
    pub fn get(&self, token: ForeignToken) -> Option<&T> {
        let slot = self.slots.get(token.index as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, token: ForeignToken) -> Option<&mut T> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, token: ForeignToken) -> bool {
        self.get(token).is_some()
    }

    /// Take the entry out; the token (and every copy of it) goes stale.
    pub fn remove(&mut self, token: ForeignToken) -> Option<T> {
        let slot = self.slots.get_mut(token.index as usize)?;
        if slot.generation != token.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(token.index);
        self.live -= 1;
        Some(value)
    }

    /// Empty the heap, handing every live entry to the caller.
    ///
    /// Generations keep counting so tokens issued before the drain stay stale.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free_list.push(index as u32);
                drained.push(value);
            }
        }
        self.live = 0;
        drained
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl<T> Default for ObjectHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ObjectHeap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("slot_count", &self.slots.len())
            .field("free_count", &self.free_list.len())
            .field("live", &self.live)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut heap = ObjectHeap::new();
        let token = heap.insert("file");
        assert_eq!(heap.get(token), Some(&"file"));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn removed_slot_is_reused_with_new_generation() {
        let mut heap = ObjectHeap::new();
        let first = heap.insert(1);
        assert_eq!(heap.remove(first), Some(1));

        let second = heap.insert(2);
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert_eq!(heap.get(first), None);
        assert_eq!(heap.get(second), Some(&2));
    }

    #[test]
    fn double_remove_is_none() {
        let mut heap = ObjectHeap::new();
        let token = heap.insert(());
        assert!(heap.remove(token).is_some());
        assert!(heap.remove(token).is_none());
        assert!(heap.is_empty());
    }

    #[test]
    fn drain_invalidates_tokens() {
        let mut heap = ObjectHeap::new();
        let a = heap.insert('a');
        let b = heap.insert('b');
        let mut drained = heap.drain();
        drained.sort();

        assert_eq!(drained, vec!['a', 'b']);
        assert!(heap.is_empty());
        assert!(!heap.contains(a));
        assert!(!heap.contains(b));
    }

    #[test]
    fn unknown_index_resolves_to_none() {
        let heap: ObjectHeap<u8> = ObjectHeap::new();
        assert_eq!(heap.get(ForeignToken::new(12, 0)), None);
    }
}
