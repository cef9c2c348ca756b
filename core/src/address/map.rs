//! Fractal address map
//!
//! `levels` levels of exactly `group_size` slots each. A slot is either empty or
//! holds a per-gnode record built by the map's record factory. Once the local
//! address is set, the slot of the local node at every level is occupied and
//! reserved: it cannot be released through `remove`.

use super::nip::Nip;
use crate::error::{MeshError, Result};
use std::fmt;

/// Builds the record stored in a freshly occupied slot
pub type RecordFactory<R> = Box<dyn Fn(usize, usize) -> R>;

/// What an `add` or `remove` did to the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChange {
    /// Slot was empty and is now occupied
    Occupied,
    /// Slot was occupied; its record was replaced
    Replaced,
    /// Slot was occupied and is now empty
    Freed,
    /// Slot was already empty
    AlreadyFree,
}

pub struct AddressMap<R> {
    levels: usize,
    group_size: usize,
    slots: Vec<Vec<Option<R>>>,
    free: Vec<usize>,
    me: Option<Nip>,
    factory: RecordFactory<R>,
}

impl<R> AddressMap<R> {
    /// Create an empty map
    pub fn new(levels: usize, group_size: usize, factory: RecordFactory<R>) -> Self {
        let slots = (0..levels)
            .map(|_| (0..group_size).map(|_| None).collect())
            .collect();
        Self {
            levels,
            group_size,
            slots,
            free: vec![group_size; levels],
            me: None,
            factory,
        }
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn me(&self) -> Option<&Nip> {
        self.me.as_ref()
    }

    /// Set the local address and occupy its slot at every level
    ///
    /// When the address changes, slots of the previous address that are not
    /// part of the new one are released.
    pub fn set_me(&mut self, nip: Nip) -> Result<()> {
        self.check_nip(&nip)?;

        if let Some(old) = self.me.take() {
            for level in 0..self.levels {
                if old.digit(level) != nip.digit(level) {
                    self.release(level, old.digit(level));
                }
            }
        }
        for level in 0..self.levels {
            let id = nip.digit(level);
            if self.slots[level][id].is_none() {
                self.slots[level][id] = Some((self.factory)(level, id));
                self.free[level] -= 1;
            }
        }
        self.me = Some(nip);
        Ok(())
    }

    /// True if `(level, id)` is the slot of the local node
    pub fn is_reserved(&self, level: usize, id: usize) -> bool {
        self.me
            .as_ref()
            .map(|me| me.digit(level) == id)
            .unwrap_or(false)
    }

    pub fn check(&self, level: usize, id: usize) -> Result<()> {
        if level >= self.levels || id >= self.group_size {
            return Err(MeshError::OutOfRange { level, id });
        }
        Ok(())
    }

    fn check_nip(&self, nip: &Nip) -> Result<()> {
        if nip.levels() != self.levels {
            return Err(MeshError::OutOfRange {
                level: nip.levels(),
                id: 0,
            });
        }
        for (level, &d) in nip.digits().iter().enumerate() {
            self.check(level, d as usize)?;
        }
        Ok(())
    }

    pub fn get(&self, level: usize, id: usize) -> Result<Option<&R>> {
        self.check(level, id)?;
        Ok(self.slots[level][id].as_ref())
    }

    pub fn get_mut(&mut self, level: usize, id: usize) -> Result<Option<&mut R>> {
        self.check(level, id)?;
        Ok(self.slots[level][id].as_mut())
    }

    /// Record at the slot, creating it if the slot is empty
    pub fn get_or_add(&mut self, level: usize, id: usize) -> Result<&mut R> {
        self.check(level, id)?;
        if self.slots[level][id].is_none() {
            self.free[level] -= 1;
        }
        let factory = &self.factory;
        Ok(self.slots[level][id].get_or_insert_with(|| factory(level, id)))
    }

    /// Store a fresh record, discarding any previous one (last writer wins)
    pub fn add(&mut self, level: usize, id: usize) -> Result<SlotChange> {
        self.check(level, id)?;
        let record = (self.factory)(level, id);
        let change = match self.slots[level][id].replace(record) {
            Some(_) => SlotChange::Replaced,
            None => {
                self.free[level] -= 1;
                SlotChange::Occupied
            }
        };
        Ok(change)
    }

    /// Empty the slot
    pub fn remove(&mut self, level: usize, id: usize) -> Result<SlotChange> {
        self.check(level, id)?;
        if self.is_reserved(level, id) {
            return Err(MeshError::ReservedSlot { level, id });
        }
        Ok(self.release(level, id))
    }

    fn release(&mut self, level: usize, id: usize) -> SlotChange {
        match self.slots[level][id].take() {
            Some(_) => {
                self.free[level] += 1;
                SlotChange::Freed
            }
            None => SlotChange::AlreadyFree,
        }
    }

    /// Lowest empty slot of a level, skipping the given ids
    ///
    /// Fails with `ResourceExhausted` when every slot is occupied or excluded.
    pub fn lowest_free(&self, level: usize, exclude: &[usize]) -> Result<usize> {
        self.check(level, 0)?;
        self.slots[level]
            .iter()
            .enumerate()
            .find(|(id, slot)| slot.is_none() && !exclude.contains(id))
            .map(|(id, _)| id)
            .ok_or(MeshError::ResourceExhausted { level })
    }

    pub fn free_count(&self, level: usize) -> Result<usize> {
        self.check(level, 0)?;
        Ok(self.free[level])
    }

    pub fn occupied_count(&self, level: usize) -> Result<usize> {
        Ok(self.group_size - self.free_count(level)?)
    }

    /// True if `addr` agrees with the local address at every level above `level`
    ///
    /// Always false while the local address is unset.
    pub fn contains_prefix(&self, addr: &Nip, level: usize) -> bool {
        match &self.me {
            Some(me) => me.same_gnode(addr, level + 1),
            None => false,
        }
    }

    pub fn to_address(&self, flat: u64) -> Result<Nip> {
        let space = (self.group_size as u64).checked_pow(self.levels as u32);
        if space.map(|s| flat >= s).unwrap_or(false) {
            return Err(MeshError::OutOfRange {
                level: self.levels,
                id: flat as usize,
            });
        }
        Ok(Nip::from_flat(flat, self.levels, self.group_size))
    }

    pub fn to_flat(&self, addr: &Nip) -> Result<u64> {
        self.check_nip(addr)?;
        Ok(addr.to_flat(self.group_size))
    }

    /// Highest differing level of two addresses, `None` when identical
    pub fn compare(&self, a: &Nip, b: &Nip) -> Option<usize> {
        a.highest_diff_level(b)
    }

    /// Occupied slots of a level in id order
    pub fn iter_level(&self, level: usize) -> impl Iterator<Item = (usize, &R)> + '_ {
        self.slots
            .get(level)
            .into_iter()
            .flat_map(|slots| slots.iter().enumerate())
            .filter_map(|(id, slot)| slot.as_ref().map(|r| (id, r)))
    }

    pub fn iter_level_mut(&mut self, level: usize) -> impl Iterator<Item = (usize, &mut R)> + '_ {
        self.slots
            .get_mut(level)
            .into_iter()
            .flat_map(|slots| slots.iter_mut().enumerate())
            .filter_map(|(id, slot)| slot.as_mut().map(|r| (id, r)))
    }
}

impl<R> fmt::Debug for AddressMap<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressMap")
            .field("levels", &self.levels)
            .field("group_size", &self.group_size)
            .field("free", &self.free)
            .field("me", &self.me)
            .finish()
    }
}
