//! Handle registry
//!
//! Arena that owns every live resource and enforces the ownership tree. Each
//! slot stores its parent handle and a live-children counter. A normal
//! release refuses while the counter is nonzero. A forced teardown cascades
//! through the subtree, leaving tombstones behind so that stale handles keep
//! reporting why they died until the tombstone is discarded.
//!
//! Freed slots are recycled in FIFO order and every reuse bumps the slot
//! generation, so a handle never resolves to a resource it was not issued for.
//! A tombstoned slot only becomes free once it is discarded.

use protocol::{Handle, Result, UsbError};
use std::collections::VecDeque;

struct Entry<R> {
    parent: Option<Handle>,
    children: u32,
    resource: R,
}

enum SlotState<R> {
    Live(Entry<R>),
    Released,
    /// Torn down by force; resolving reports the stored error
    Revoked(UsbError),
}

struct Slot<R> {
    generation: u32,
    state: SlotState<R>,
}

pub struct Registry<R> {
    slots: Vec<Slot<R>>,
    free: VecDeque<u32>,
    live: usize,
}

impl<R> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Registry<R> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
            live: 0,
        }
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a resource as a child of `parent`, or as a root
    pub fn register(&mut self, parent: Option<Handle>, resource: R) -> Result<Handle> {
        if let Some(parent) = parent {
            let entry = self.entry_mut(parent).map_err(|_| UsbError::InvalidParent)?;
            entry.children += 1;
        }

        let entry = Entry {
            parent,
            children: 0,
            resource,
        };

        let handle = match self.free.pop_front() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.state = SlotState::Live(entry);
                Handle::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Live(entry),
                });
                Handle::new(index, 0)
            }
        };

        self.live += 1;
        Ok(handle)
    }

    pub fn resolve(&self, handle: Handle) -> Result<&R> {
        self.entry(handle).map(|entry| &entry.resource)
    }

    pub fn parent(&self, handle: Handle) -> Result<Option<Handle>> {
        self.entry(handle).map(|entry| entry.parent)
    }

    pub fn child_count(&self, handle: Handle) -> Result<u32> {
        self.entry(handle).map(|entry| entry.children)
    }

    /// Live direct children of `handle`, in slot order
    pub fn children_of(&self, handle: Handle) -> Vec<Handle> {
        self.iter()
            .filter(|(_, entry)| entry.parent == Some(handle))
            .map(|(child, _)| child)
            .collect()
    }

    /// Live roots and their resources
    pub fn roots(&self) -> impl Iterator<Item = (Handle, &R)> {
        self.iter()
            .filter(|(_, entry)| entry.parent.is_none())
            .map(|(handle, entry)| (handle, &entry.resource))
    }

    /// Release one resource that has no live children
    pub fn release(&mut self, handle: Handle) -> Result<R> {
        if self.entry(handle)?.children > 0 {
            return Err(UsbError::ResourceInUse);
        }
        self.remove(handle, None).ok_or(UsbError::InvalidHandle)
    }

    /// Release a resource together with its whole subtree
    ///
    /// With a tombstone, every removed handle keeps resolving to that error.
    /// Returns the removed handles, deepest first.
    pub fn release_cascade(
        &mut self,
        handle: Handle,
        tombstone: Option<UsbError>,
    ) -> Result<Vec<Handle>> {
        self.entry(handle)?;
        let mut removed = self.release_subtree(handle, tombstone.clone());
        self.remove(handle, tombstone);
        removed.push(handle);
        Ok(removed)
    }

    /// Release every descendant of `handle`, keeping `handle` itself live
    pub fn release_descendants(
        &mut self,
        handle: Handle,
        tombstone: Option<UsbError>,
    ) -> Result<Vec<Handle>> {
        self.entry(handle)?;
        Ok(self.release_subtree(handle, tombstone))
    }

    /// Turn a tombstone back into a plain released slot and make it reusable
    ///
    /// Returns false if `handle` does not name a tombstone.
    pub fn discard_tombstone(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.index() as usize) {
            Some(slot)
                if slot.generation == handle.generation()
                    && matches!(slot.state, SlotState::Revoked(_)) =>
            {
                slot.state = SlotState::Released;
                self.free.push_back(handle.index());
                true
            }
            _ => false,
        }
    }

    fn release_subtree(&mut self, handle: Handle, tombstone: Option<UsbError>) -> Vec<Handle> {
        let mut removed = Vec::new();
        for child in self.children_of(handle) {
            removed.extend(self.release_subtree(child, tombstone.clone()));
            self.remove(child, tombstone.clone());
            removed.push(child);
        }
        removed
    }

    /// Free a live slot; children are not checked
    fn remove(&mut self, handle: Handle, tombstone: Option<UsbError>) -> Option<R> {
        let index = handle.index();
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == handle.generation())?;
        if !matches!(slot.state, SlotState::Live(_)) {
            return None;
        }

        let reusable = tombstone.is_none();
        let state = match tombstone {
            Some(error) => SlotState::Revoked(error),
            None => SlotState::Released,
        };
        let SlotState::Live(entry) = std::mem::replace(&mut slot.state, state) else {
            return None;
        };

        if let Some(parent) = entry.parent
            && let Ok(parent) = self.entry_mut(parent)
        {
            parent.children = parent.children.saturating_sub(1);
        }

        if reusable {
            self.free.push_back(index);
        }
        self.live -= 1;
        Some(entry.resource)
    }

    fn iter(&self) -> impl Iterator<Item = (Handle, &Entry<R>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match &slot.state {
            SlotState::Live(entry) => Some((Handle::new(index as u32, slot.generation), entry)),
            _ => None,
        })
    }

    fn entry(&self, handle: Handle) -> Result<&Entry<R>> {
        let slot = self
            .slots
            .get(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .ok_or(UsbError::InvalidHandle)?;

        match &slot.state {
            SlotState::Live(entry) => Ok(entry),
            SlotState::Released => Err(UsbError::InvalidHandle),
            SlotState::Revoked(error) => Err(error.clone()),
        }
    }

    fn entry_mut(&mut self, handle: Handle) -> Result<&mut Entry<R>> {
        let slot = self
            .slots
            .get_mut(handle.index() as usize)
            .filter(|slot| slot.generation == handle.generation())
            .ok_or(UsbError::InvalidHandle)?;

        match &mut slot.state {
            SlotState::Live(entry) => Ok(entry),
            SlotState::Released => Err(UsbError::InvalidHandle),
            SlotState::Revoked(error) => Err(error.clone()),
        }
    }
}
