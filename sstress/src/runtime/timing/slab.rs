//! Fixed-capacity generational slab backing the timing wheel.

use core::num::NonZeroUsize;

/// Stable reference to an occupied slab entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlabKey {
    pub index: u32,
    pub generation: u32,
}

enum Entry<T> {
    Occupied {
        payload: T,
        deadline: u64,
        generation: u32,
    },
    Vacant {
        generation: u32,
        next_free: Option<u32>,
    },
}

pub(crate) struct Slab<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Slab<T> {
    /// Creates a slab with every entry vacant.
    ///
    /// Capacity is clamped to `u32::MAX` entries.
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        let capacity = u32::try_from(capacity.get()).unwrap_or(u32::MAX);
        let entries = (0..capacity)
            .map(|i| Entry::Vacant {
                generation: 0,
                next_free: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();
        Self {
            entries,
            free_head: Some(0),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, payload: T, deadline: u64) -> Option<SlabKey> {
        let index = self.free_head?;
        let slot = &mut self.entries[index as usize];
        let Entry::Vacant {
            generation,
            next_free,
        } = *slot
        else {
            unreachable!("free list points at an occupied entry");
        };
        self.free_head = next_free;
        *slot = Entry::Occupied {
            payload,
            deadline,
            generation,
        };
        self.len += 1;
        Some(SlabKey { index, generation })
    }

    /// Deadline of the entry behind `key`, if it is still live.
    pub fn deadline(&self, key: SlabKey) -> Option<u64> {
        match self.entries.get(key.index as usize)? {
            Entry::Occupied {
                deadline,
                generation,
                ..
            } if *generation == key.generation => Some(*deadline),
            _ => None,
        }
    }

    /// Removes the entry behind `key`; stale keys are rejected.
    pub fn remove(&mut self, key: SlabKey) -> Option<T> {
        let slot = self.entries.get_mut(key.index as usize)?;
        match slot {
            Entry::Occupied { generation, .. } if *generation == key.generation => {}
            _ => return None,
        }
        let vacated = Entry::Vacant {
            generation: key.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Entry::Occupied { payload, .. } = core::mem::replace(slot, vacated) else {
            unreachable!("checked occupied above");
        };
        self.free_head = Some(key.index);
        self.len -= 1;
        Some(payload)
    }

    /// Earliest deadline among live entries.
    pub fn min_deadline(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Occupied { deadline, .. } => Some(*deadline),
                Entry::Vacant { .. } => None,
            })
            .min()
    }
}
