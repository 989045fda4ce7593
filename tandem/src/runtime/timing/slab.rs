//! Growable slab with an intrusive free list.
//!
//! Slots are addressed by [`SlabIndex`]. Freed slots are reused LIFO, so an
//! index alone does not identify a value over time; callers pair it with their
//! own generation (the timer registry uses the timer sequence number).

use core::marker::PhantomData;

/// Newtype for slab indices to prevent cross-slab misuse.
// Manual Copy/Clone: derive would require T: Copy, but PhantomData is just a marker.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SlabIndex<T>(u32, PhantomData<T>);

impl<T> Copy for SlabIndex<T> {}

impl<T> Clone for SlabIndex<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> From<u32> for SlabIndex<T> {
    #[inline]
    fn from(idx: u32) -> Self {
        Self(idx, PhantomData)
    }
}

impl<T> From<SlabIndex<T>> for u32 {
    #[inline]
    fn from(idx: SlabIndex<T>) -> Self {
        idx.0
    }
}

impl<T> From<SlabIndex<T>> for usize {
    #[inline]
    fn from(idx: SlabIndex<T>) -> Self {
        idx.0 as Self
    }
}

/// Slot in the slab.
enum Entry<T> {
    /// Occupied slot.
    Occupied(T),
    /// Free slot with link to next free.
    Free { next: Option<SlabIndex<T>> },
}

/// Slab of `T` values that grows on demand.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<SlabIndex<T>>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    /// Creates an empty slab.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is occupied.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value`, reusing a free slot when one exists.
    ///
    /// # Panics
    ///
    /// Panics if the slab would exceed `u32::MAX` slots.
    pub fn insert(&mut self, value: T) -> SlabIndex<T> {
        self.len += 1;
        if let Some(head) = self.free_head {
            let next = match &self.entries[usize::from(head)] {
                Entry::Free { next } => *next,
                Entry::Occupied(_) => unreachable!("free_head must point to free slot"),
            };
            self.free_head = next;
            self.entries[usize::from(head)] = Entry::Occupied(value);
            return head;
        }

        let idx = u32::try_from(self.entries.len()).expect("slab exceeds u32::MAX slots");
        self.entries.push(Entry::Occupied(value));
        SlabIndex::from(idx)
    }

    /// Frees a slot, returning its value if it was occupied.
    pub fn remove(&mut self, idx: SlabIndex<T>) -> Option<T> {
        let slot = self.entries.get_mut(usize::from(idx))?;
        if matches!(slot, Entry::Free { .. }) {
            return None;
        }
        let old = std::mem::replace(
            slot,
            Entry::Free {
                next: self.free_head,
            },
        );
        self.free_head = Some(idx);
        self.len -= 1;
        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Gets immutable ref to the value at `idx` if occupied.
    #[must_use]
    pub fn get(&self, idx: SlabIndex<T>) -> Option<&T> {
        match self.entries.get(usize::from(idx))? {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Gets mutable ref to the value at `idx` if occupied.
    pub fn get_mut(&mut self, idx: SlabIndex<T>) -> Option<&mut T> {
        match self.entries.get_mut(usize::from(idx))? {
            Entry::Occupied(value) => Some(value),
            Entry::Free { .. } => None,
        }
    }

    /// Occupied slots in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (SlabIndex<T>, &T)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Entry::Occupied(value) => Some((SlabIndex::from(i as u32), value)),
                Entry::Free { .. } => None,
            })
    }

    /// Frees every slot for which `keep` returns `false`.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        for i in 0..self.entries.len() {
            let drop_it = match &self.entries[i] {
                Entry::Occupied(value) => !keep(value),
                Entry::Free { .. } => false,
            };
            if drop_it {
                self.remove(SlabIndex::from(i as u32));
            }
        }
    }

    /// Drops every value and releases the storage.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.free_head = None;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut slab = Slab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get(a), Some(&"a"));
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.remove(a), None, "double free is a no-op");
        assert_eq!(slab.get(b), Some(&"b"));
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut slab = Slab::new();
        let a = slab.insert(1);
        let _b = slab.insert(2);
        slab.remove(a);
        let c = slab.insert(3);
        assert_eq!(u32::from(a), u32::from(c));
        assert_eq!(slab.get(c), Some(&3));
    }

    #[test]
    fn iter_in_slot_order() {
        let mut slab = Slab::new();
        let a = slab.insert(10);
        slab.insert(20);
        slab.insert(30);
        slab.remove(a);
        slab.insert(40);
        let values: Vec<_> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![40, 20, 30]);
    }

    #[test]
    fn retain_frees_rejected() {
        let mut slab = Slab::new();
        for i in 0..6 {
            slab.insert(i);
        }
        slab.retain(|v| v % 2 == 0);
        assert_eq!(slab.len(), 3);
        let values: Vec<_> = slab.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 4]);
    }

    #[test]
    fn out_of_range_index() {
        let mut slab: Slab<u8> = Slab::new();
        assert!(slab.get(SlabIndex::from(7)).is_none());
        assert!(slab.remove(SlabIndex::from(7)).is_none());
    }
}
