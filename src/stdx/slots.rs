//! Generation-checked slot arena.
//!
//! Values are addressed by a [`SlotKey`] combining a slot index with the
//! generation the slot had when the value was inserted. Removing a value bumps
//! the slot's generation, so a key held past removal resolves to `None` instead
//! of aliasing whatever reuses the slot.
//!
//! Keys pack into a non-zero `u64` ([`SlotKey::to_u64`]) so they can travel
//! through a kernel `user_data` field and be validated on the way back.
//!
//! Freed slots are reused in LIFO order. Not thread-safe.

use core::num::NonZeroU32;

// Compile-time: verify u32 fits in usize
const _: () = assert!(
    size_of::<usize>() >= size_of::<u32>(),
    "Platform must have at least 32-bit addressing"
);

/// Handle to a value stored in [`Slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    index: u32,
    generation: NonZeroU32,
}

impl SlotKey {
    /// Packs as `generation << 32 | index`. Never zero.
    #[inline]
    pub fn to_u64(self) -> u64 {
        let packed = ((self.generation.get() as u64) << 32) | self.index as u64;
        assert!(packed != 0);
        packed
    }

    /// Inverse of [`to_u64`](Self::to_u64). Returns `None` for a zero generation,
    /// which no live key can carry.
    #[inline]
    pub fn from_u64(packed: u64) -> Option<Self> {
        let generation = NonZeroU32::new((packed >> 32) as u32)?;
        Some(Self {
            index: packed as u32,
            generation,
        })
    }
}

struct Slot<T> {
    generation: NonZeroU32,
    value: Option<T>,
}

/// Growable arena of `T` addressed by generation-checked keys.
///
/// # Invariants
///
/// - `len` equals the number of occupied slots
/// - every index in `free` names a vacant slot, and each vacant slot appears once
pub struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: u32,
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slots<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stores `value` and returns its key.
    ///
    /// # Panics
    ///
    /// Panics if the arena already holds `u32::MAX` slots.
    pub fn insert(&mut self, value: T) -> SlotKey {
        let old_len = self.len;

        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                assert!(slot.value.is_none(), "free list names an occupied slot");
                slot.value = Some(value);
                SlotKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).expect("slot arena exhausted");
                assert!(index < u32::MAX, "slot arena exhausted");
                let generation = NonZeroU32::MIN;
                self.slots.push(Slot {
                    generation,
                    value: Some(value),
                });
                SlotKey { index, generation }
            }
        };

        self.len += 1;
        assert!(self.len == old_len + 1);
        key
    }

    #[inline]
    pub fn get(&self, key: SlotKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    /// Removes and returns the value for `key`, invalidating every copy of the key.
    ///
    /// Returns `None` (and changes nothing) if the key is stale or unknown.
    pub fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;

        // Generation 0 is reserved for "never a live key"; wrap back to 1.
        slot.generation = slot.generation.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.free.push(key.index);

        assert!(self.len > 0);
        self.len -= 1;
        Some(value)
    }

    /// Removes every value, yielding them with their (now stale) keys.
    pub fn drain(&mut self) -> Vec<(SlotKey, T)> {
        let mut out = Vec::with_capacity(self.len as usize);
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.value.is_none() {
                continue;
            }
            let key = SlotKey {
                index: index as u32,
                generation: slot.generation,
            };
            if let Some(value) = self.remove(key) {
                out.push((key, value));
            }
        }
        assert!(self.is_empty());
        out
    }
}
