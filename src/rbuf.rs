//! Fixed-capacity circular buffer with CAS-advanced head and tail.
//!
//! The slot count is a power of two and one slot is always kept empty, so
//! that `head == tail` means empty and `head + 1 == tail` means full without
//! a separate counter. `head` and `tail` only ever increase (wrapping) and are
//! masked on use.

use std::cell::UnsafeCell;
use std::collections::TryReserveError;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{fmt, hint};

use crate::error::*;

/// Element that can be moved by a byte offset.
///
/// Implemented by values that point into a backing array which may be
/// reallocated to a new address.
pub trait Relocate: Sized {
    /// Return this value shifted by `offset` bytes.
    fn relocate(self, offset: isize) -> Self;
}

impl Relocate for usize {
    #[inline]
    fn relocate(self, offset: isize) -> Self {
        self.wrapping_add_signed(offset)
    }
}

impl<U> Relocate for *mut U {
    #[inline]
    fn relocate(self, offset: isize) -> Self {
        self.wrapping_byte_offset(offset)
    }
}

impl<U> Relocate for *const U {
    #[inline]
    fn relocate(self, offset: isize) -> Self {
        self.wrapping_byte_offset(offset)
    }
}

/// Returned by [`RingBuffer::add`] when the ring is full. Gives the rejected
/// item back.
pub struct RingFull<T>(pub T);

impl<T> RingFull<T> {
    /// Take back the item that could not be added.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for RingFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RingFull(..)")
    }
}

impl<T> From<RingFull<T>> for DatError {
    fn from(_: RingFull<T>) -> Self {
        DatError::InsufficientResources(Resource::RingBuffer)
    }
}

struct Slot<T> {
    full: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            full: AtomicBool::new(false),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

/// Ring buffer of owned items.
///
/// Producers may race each other in [`add`](Self::add). Consumers are
/// expected to be serialized by the owner, but a racing [`remove`](Self::remove)
/// never hands out the same item twice.
pub struct RingBuffer<T> {
    slots: Box<[Slot<T>]>,
    lim: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// SAFETY: items are moved in and out through slots guarded by the `full`
// flag; a slot is accessed by exactly one thread between flag transitions.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

fn alloc_slots<T>(n: usize) -> Result<Box<[Slot<T>]>, TryReserveError> {
    let mut slots = Vec::new();
    slots.try_reserve_exact(n)?;
    slots.extend((0..n).map(|_| Slot::empty()));
    Ok(slots.into_boxed_slice())
}

#[inline]
fn slot_count(capacity: usize) -> Option<usize> {
    capacity.checked_add(1)?.checked_next_power_of_two()
}

impl<T> RingBuffer<T> {
    /// Create a ring that holds at least `capacity` items.
    pub fn new(capacity: usize) -> DatResult<Self> {
        if capacity == 0 {
            return Err(DatError::InvalidParameter(Param::Capacity));
        }
        let n = slot_count(capacity).ok_or(DatError::InvalidParameter(Param::Capacity))?;
        let slots =
            alloc_slots(n).map_err(|_| DatError::InsufficientResources(Resource::Memory))?;
        Ok(Self {
            slots,
            lim: n - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }

    /// Maximum number of items the ring can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.lim
    }

    /// Number of queued items.
    #[inline]
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & self.lim
    }

    /// Whether no item is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Append an item. Fails without touching the ring when it is full.
    pub fn add(&self, item: T) -> Result<(), RingFull<T>> {
        let mut pos = self.head.load(Ordering::Acquire);
        loop {
            if (pos.wrapping_add(1) & self.lim) == (self.tail.load(Ordering::Acquire) & self.lim) {
                return Err(RingFull(item));
            }
            match self.head.compare_exchange_weak(
                pos,
                pos.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => pos = cur,
            }
        }

        let slot = &self.slots[pos.wrapping_add(1) & self.lim];
        // A lagging consumer may still be moving the previous item out.
        while slot.full.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        // SAFETY: the head CAS reserved this slot and `full == false` means no
        // consumer owns it.
        unsafe { (*slot.value.get()).write(item) };
        slot.full.store(true, Ordering::Release);
        Ok(())
    }

    /// Take the oldest item, or `None` if the ring is empty.
    pub fn remove(&self) -> Option<T> {
        let mut pos = self.tail.load(Ordering::Acquire);
        loop {
            if (pos & self.lim) == (self.head.load(Ordering::Acquire) & self.lim) {
                return None;
            }
            match self.tail.compare_exchange_weak(
                pos,
                pos.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => pos = cur,
            }
        }

        let slot = &self.slots[pos.wrapping_add(1) & self.lim];
        // The producer that reserved the slot may not have stored yet.
        while !slot.full.load(Ordering::Acquire) {
            hint::spin_loop();
        }
        // SAFETY: `full == true` means the slot holds an initialized item and
        // the tail CAS made this thread its only reader.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.full.store(false, Ordering::Release);
        Some(item)
    }

    /// Grow the ring so that it holds at least `new_capacity` items. Queued
    /// items keep their order.
    ///
    /// Shrinking, or asking for no more room than is already available, is
    /// rejected as an invalid parameter.
    pub fn resize(&mut self, new_capacity: usize) -> DatResult<()> {
        if new_capacity <= self.capacity() {
            return Err(DatError::InvalidParameter(Param::Capacity));
        }
        let n = slot_count(new_capacity).ok_or(DatError::InvalidParameter(Param::Capacity))?;
        let slots =
            alloc_slots(n).map_err(|_| DatError::InsufficientResources(Resource::Memory))?;

        let mut moved = 0;
        while let Some(item) = self.remove() {
            moved += 1;
            let slot = &slots[moved];
            // SAFETY: the new slot array is private to this call.
            unsafe { (*slot.value.get()).write(item) };
            slot.full.store(true, Ordering::Relaxed);
        }

        self.slots = slots;
        self.lim = n - 1;
        *self.head.get_mut() = moved;
        *self.tail.get_mut() = 0;
        Ok(())
    }

    /// Shift every queued item by `offset` bytes, after the array they point
    /// into has been moved.
    pub fn adjust(&mut self, offset: isize)
    where
        T: Relocate,
    {
        let head = *self.head.get_mut();
        let mut pos = *self.tail.get_mut();
        while (pos & self.lim) != (head & self.lim) {
            pos = pos.wrapping_add(1);
            let slot = &mut self.slots[pos & self.lim];
            let value = slot.value.get_mut();
            // SAFETY: every slot between tail and head is full, and `&mut self`
            // excludes producers and consumers.
            let item = unsafe { value.assume_init_read() };
            value.write(item.relocate(offset));
        }
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.remove().is_some() {}
    }
}

impl<T> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}
