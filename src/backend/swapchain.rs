//! Swapchains with buffer-age tracking.
//!
//! A swapchain hands out buffers ("slots") for rendering. Each slot remembers its age: the number
//! of frames since its contents were last presented, with 0 meaning the contents are undefined.
//! Together with the [`DamageJournal`] this lets a layer repaint only what changed since the slot
//! was last on screen.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::utils::{Physical, Size};
use tracing::{debug, warn};

use super::allocator::{Allocator, Buffer};
use crate::utils::Region;

static SWAPCHAIN_SERIAL_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Per-frame damage history, newest first.
#[derive(Debug)]
pub struct DamageJournal {
    log: VecDeque<Region<Physical>>,
    capacity: usize,
}

impl DamageJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&mut self, damage: Region<Physical>) {
        if self.log.len() == self.capacity {
            self.log.pop_back();
        }
        self.log.push_front(damage);
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Returns the damage of the `age - 1` most recent frames.
    ///
    /// This is what changed on screen since a buffer of this age was presented. Returns `None`
    /// when the age is 0 or the history does not reach that far back.
    pub fn accumulate(&self, age: u32) -> Option<Region<Physical>> {
        if age == 0 {
            return None;
        }

        let needed = age as usize - 1;
        if needed > self.log.len() {
            return None;
        }

        let mut rv = Region::new();
        for damage in self.log.iter().take(needed) {
            rv.add_region(damage);
        }
        Some(rv)
    }
}

/// Identifies one slot of one particular swapchain.
///
/// Ids of a swapchain that has since been replaced never match the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    serial: u32,
    index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for acquisition.
    Free,
    /// Being rendered into.
    Acquired,
    /// Committed to the display and not yet released.
    Scanout,
}

#[derive(Debug)]
struct Slot {
    buffer: Buffer,
    age: u32,
    state: SlotState,
}

/// A freshly acquired slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredSlot {
    pub id: SlotId,
    pub age: u32,
}

#[derive(Debug)]
pub struct Swapchain {
    serial: u32,
    size: Size<i32, Physical>,
    format: Fourcc,
    modifiers: Vec<Modifier>,
    max_slots: usize,
    slots: Vec<Slot>,
    journal: DamageJournal,
}

impl Swapchain {
    /// Creates an empty swapchain. Buffers are allocated lazily on acquisition.
    pub fn new(
        size: Size<i32, Physical>,
        format: Fourcc,
        modifiers: Vec<Modifier>,
        max_slots: usize,
        journal_depth: usize,
    ) -> Self {
        Self {
            serial: SWAPCHAIN_SERIAL_COUNTER.fetch_add(1, Ordering::Relaxed),
            size,
            format,
            modifiers,
            max_slots: max_slots.clamp(1, usize::from(u16::MAX)),
            slots: Vec::new(),
            journal: DamageJournal::new(journal_depth),
        }
    }

    pub fn size(&self) -> Size<i32, Physical> {
        self.size
    }

    pub fn format(&self) -> Fourcc {
        self.format
    }

    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    /// Whether this swapchain can keep serving frames of these parameters.
    pub fn matches(
        &self,
        size: Size<i32, Physical>,
        format: Fourcc,
        modifiers: &[Modifier],
    ) -> bool {
        self.size == size && self.format == format && self.modifiers == modifiers
    }

    pub fn journal(&self) -> &DamageJournal {
        &self.journal
    }

    /// Drops all damage history, so every slot repaints fully next time.
    pub fn invalidate_damage(&mut self) {
        self.journal.clear();
        for slot in &mut self.slots {
            slot.age = 0;
        }
    }

    /// Number of slots currently allocated.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, id: SlotId) -> Option<SlotState> {
        self.slot(id).map(|slot| slot.state)
    }

    pub fn age(&self, id: SlotId) -> Option<u32> {
        self.slot(id).map(|slot| slot.age)
    }

    pub fn buffer(&self, id: SlotId) -> Option<&Buffer> {
        self.slot(id).map(|slot| &slot.buffer)
    }

    pub fn buffer_mut(&mut self, id: SlotId) -> Option<&mut Buffer> {
        self.slot_mut(id).map(|slot| &mut slot.buffer)
    }

    /// Returns a free slot, allocating a new one when all existing slots are busy.
    ///
    /// Returns `None` if the swapchain is exhausted or the allocation failed.
    pub fn acquire(&mut self, allocator: &mut dyn Allocator) -> Option<AcquiredSlot> {
        let _span = tracy_client::span!("Swapchain::acquire");

        if self.slots.iter().any(|s| s.state == SlotState::Acquired) {
            warn!("a swapchain slot is already acquired");
            return None;
        }

        let index = match self.slots.iter().position(|s| s.state == SlotState::Free) {
            Some(index) => index,
            None => {
                if self.slots.len() >= self.max_slots {
                    debug!("all {} swapchain slots are busy", self.slots.len());
                    return None;
                }

                let buffer = match allocator.create_buffer(self.size, self.format, &self.modifiers)
                {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        debug!("error allocating swapchain buffer: {err}");
                        return None;
                    }
                };

                self.slots.push(Slot {
                    buffer,
                    age: 0,
                    state: SlotState::Free,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.state = SlotState::Acquired;
        Some(AcquiredSlot {
            id: SlotId {
                serial: self.serial,
                index: index as u16,
            },
            age: slot.age,
        })
    }

    /// Marks an acquired slot as committed for display and records the frame's damage.
    ///
    /// The committed slot becomes age 1 and every other slot with defined contents ages by one.
    pub fn submit(&mut self, id: SlotId, damage: &Region<Physical>) {
        let Some(index) = self.index(id) else {
            warn!("submitting a slot of another swapchain");
            return;
        };
        if self.slots[index].state != SlotState::Acquired {
            warn!("submitting a slot that was not acquired");
            return;
        }

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == index {
                slot.age = 1;
                slot.state = SlotState::Scanout;
            } else if slot.age > 0 {
                slot.age += 1;
            }
        }
        self.journal.add(damage.clone());
    }

    /// Returns an acquired slot without presenting it. Its contents keep their previous age.
    pub fn abort(&mut self, id: SlotId) {
        if let Some(slot) = self.slot_mut(id) {
            if slot.state == SlotState::Acquired {
                slot.state = SlotState::Free;
            }
        }
    }

    /// Called once the display no longer reads from a committed slot.
    pub fn release(&mut self, id: SlotId) {
        if let Some(slot) = self.slot_mut(id) {
            if slot.state == SlotState::Scanout {
                slot.state = SlotState::Free;
            }
        }
    }

    fn index(&self, id: SlotId) -> Option<usize> {
        (id.serial == self.serial && usize::from(id.index) < self.slots.len())
            .then_some(usize::from(id.index))
    }

    fn slot(&self, id: SlotId) -> Option<&Slot> {
        self.index(id).map(|i| &self.slots[i])
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut Slot> {
        self.index(id).map(|i| &mut self.slots[i])
    }
}
