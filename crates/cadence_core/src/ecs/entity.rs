//! # Entity Identity
//!
//! An entity is a single 32-bit value. Identity and bookkeeping flags share
//! the word:
//!
//! ```text
//!  31      24 23 22 21 20 19                    0
//! +----------+-----+--+--+-----------------------+
//! | reserved | LS  |LO|HI|        raw id         |
//! +----------+-----+--+--+-----------------------+
//! ```
//!
//! - raw id: immutable once allocated, `0` is the null id
//! - HI / LO: priority flags, neither set means NORMAL
//! - LS: life-state code (`00` register, `01` alive, `10` unregister,
//!   `11` destroyed)
//!
//! Flag bits only change through the codec methods on [`EntityId`].

use std::fmt;

use parking_lot::Mutex;

use crate::error::{CapacityError, IllegalTransition};

/// Mask of the raw id bits.
const RAW_MASK: u32 = 0x000F_FFFF;
/// High priority flag.
const HIGH_BIT: u32 = 1 << 20;
/// Low priority flag.
const LOW_BIT: u32 = 1 << 21;
/// Both priority flags.
const PRIORITY_MASK: u32 = HIGH_BIT | LOW_BIT;
/// Shift of the life-state code.
const LIFE_SHIFT: u32 = 22;
/// Mask of the life-state code.
const LIFE_MASK: u32 = 0b11 << LIFE_SHIFT;

/// Largest raw id the allocator hands out.
pub const MAX_RAW_ID: u32 = RAW_MASK;

/// Scheduling priority carried in an entity id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Bit 20 set.
    High,
    /// No priority bit set.
    #[default]
    Normal,
    /// Bit 21 set.
    Low,
}

/// Lifecycle classification carried in an entity id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifeState {
    /// Created this frame, not yet visible as alive.
    #[default]
    Register = 0b00,
    /// Fully registered.
    Alive = 0b01,
    /// Destroy requested, still readable this frame.
    Unregister = 0b10,
    /// Swept from its collection at the next commit.
    Destroyed = 0b11,
}

impl LifeState {
    /// Decodes a two-bit life-state code.
    #[inline]
    #[must_use]
    const fn from_code(code: u32) -> Self {
        match code & 0b11 {
            0b00 => Self::Register,
            0b01 => Self::Alive,
            0b10 => Self::Unregister,
            _ => Self::Destroyed,
        }
    }

    /// Whether `self -> next` is one of the legal forward transitions.
    ///
    /// Staying in the same state is not a transition and returns `false`;
    /// [`EntityId::transition`] treats it as a no-op.
    #[inline]
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Register, Self::Alive)
                | (Self::Register | Self::Alive, Self::Unregister)
                | (Self::Unregister, Self::Destroyed)
        )
    }
}

/// Bit-packed entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EntityId(u32);

impl EntityId {
    /// The null id (raw id 0).
    pub const NULL: Self = Self(0);

    /// Creates an id in REGISTER state with NORMAL priority.
    ///
    /// Bits above the raw id range are discarded.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & RAW_MASK)
    }

    /// Reinterprets a full 32-bit value. Reserved bits are cleared.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & (RAW_MASK | PRIORITY_MASK | LIFE_MASK))
    }

    /// Returns the full 32-bit value.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns the raw numeric identity.
    #[inline]
    #[must_use]
    pub const fn raw_id(self) -> u32 {
        self.0 & RAW_MASK
    }

    /// Checks if this is the null id.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.raw_id() == 0
    }

    /// Returns a copy with the priority flags replaced.
    #[inline]
    #[must_use]
    pub const fn with_priority(self, priority: Priority) -> Self {
        let cleared = self.0 & !PRIORITY_MASK;
        match priority {
            Priority::High => Self(cleared | HIGH_BIT),
            Priority::Normal => Self(cleared),
            Priority::Low => Self(cleared | LOW_BIT),
        }
    }

    /// Decodes the priority flags. An invalid encoding (both set) reads as NORMAL.
    #[inline]
    #[must_use]
    pub const fn priority(self) -> Priority {
        match self.0 & PRIORITY_MASK {
            HIGH_BIT => Priority::High,
            LOW_BIT => Priority::Low,
            _ => Priority::Normal,
        }
    }

    /// Returns a copy with the life-state code replaced, unchecked.
    #[inline]
    #[must_use]
    pub const fn with_life_state(self, state: LifeState) -> Self {
        Self((self.0 & !LIFE_MASK) | ((state as u32) << LIFE_SHIFT))
    }

    /// Decodes the life-state code.
    #[inline]
    #[must_use]
    pub const fn life_state(self) -> LifeState {
        LifeState::from_code(self.0 >> LIFE_SHIFT)
    }

    /// Whether two ids carry different life-state codes.
    #[inline]
    #[must_use]
    pub const fn is_life_changed(a: Self, b: Self) -> bool {
        (a.0 ^ b.0) & LIFE_MASK != 0
    }

    /// Checked life-state change.
    ///
    /// Moving to the current state succeeds without change, which is what
    /// makes a repeated destroy harmless.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] for anything but REGISTER→ALIVE,
    /// REGISTER→UNREGISTER, ALIVE→UNREGISTER and UNREGISTER→DESTROYED.
    pub fn transition(self, next: LifeState) -> Result<Self, IllegalTransition> {
        let from = self.life_state();
        if from == next {
            return Ok(self);
        }
        if from.can_transition_to(next) {
            Ok(self.with_life_state(next))
        } else {
            Err(IllegalTransition { from, to: next })
        }
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityId")
            .field("raw", &self.raw_id())
            .field("priority", &self.priority())
            .field("life", &self.life_state())
            .finish()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}[{:?}/{:?}]", self.raw_id(), self.priority(), self.life_state())
    }
}

// ============================================================================
// ALLOCATOR
// ============================================================================

/// Free-list state behind the allocator lock.
#[derive(Debug)]
struct AllocatorState {
    /// Next never-used raw id.
    next: u32,
    /// Raw ids returned after their entity was swept.
    free: Vec<u32>,
    /// Number of raw ids currently handed out.
    live: u32,
}

/// Thread-safe raw id allocator with recycling.
///
/// Raw ids go back on the free list only once the entity's DESTROYED row
/// has been swept by a commit, so a stale id can never alias a live one
/// within the same frame.
#[derive(Debug)]
pub struct EntityIdAllocator {
    state: Mutex<AllocatorState>,
    limit: u32,
}

impl EntityIdAllocator {
    /// Creates an allocator over the full raw id range.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(MAX_RAW_ID)
    }

    /// Creates an allocator that hands out at most `limit` raw ids.
    #[must_use]
    pub fn with_limit(limit: u32) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                next: 1,
                free: Vec::new(),
                live: 0,
            }),
            limit: limit.min(MAX_RAW_ID),
        }
    }

    /// Allocates a fresh id in REGISTER state with NORMAL priority.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] when every raw id is in use.
    pub fn allocate(&self) -> Result<EntityId, CapacityError> {
        let mut state = self.state.lock();
        let raw = if let Some(raw) = state.free.pop() {
            raw
        } else if state.next <= self.limit {
            let raw = state.next;
            state.next += 1;
            raw
        } else {
            return Err(CapacityError { limit: self.limit });
        };
        state.live += 1;
        Ok(EntityId::from_raw(raw))
    }

    /// Returns a swept entity's raw id to the free list.
    pub fn release(&self, id: EntityId) {
        if id.is_null() {
            crate::error::misuse!("released the null entity id");
            return;
        }
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        state.free.push(id.raw_id());
    }

    /// Number of raw ids currently handed out.
    #[must_use]
    pub fn live_count(&self) -> u32 {
        self.state.lock().live
    }
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [LifeState; 4] = [
        LifeState::Register,
        LifeState::Alive,
        LifeState::Unregister,
        LifeState::Destroyed,
    ];

    #[test]
    fn test_priority_round_trip_preserves_raw_and_life() {
        for raw in [1, 0xABCDE, 0x8_0000, MAX_RAW_ID - 1, MAX_RAW_ID] {
            for state in ALL_STATES {
                let id = EntityId::from_raw(raw).with_life_state(state);
                for priority in [Priority::High, Priority::Normal, Priority::Low] {
                    let tagged = id.with_priority(priority);
                    assert_eq!(tagged.priority(), priority);
                    assert_eq!(tagged.raw_id(), raw);
                    assert_eq!(tagged.life_state(), state);
                }
            }
        }
    }

    #[test]
    fn test_both_priority_bits_decode_as_normal() {
        let id = EntityId::from_bits(7 | HIGH_BIT | LOW_BIT);
        assert_eq!(id.priority(), Priority::Normal);
        assert_eq!(id.with_priority(Priority::Low).priority(), Priority::Low);
    }

    #[test]
    fn test_life_state_closure() {
        let id = EntityId::from_raw(42).with_priority(Priority::High);
        for state in ALL_STATES {
            let changed = id.with_life_state(state);
            assert_eq!(changed.life_state(), state);
            assert_eq!(changed.raw_id(), 42);
            assert_eq!(changed.priority(), Priority::High);
        }
    }

    #[test]
    fn test_raw_id_masks_and_reserved_bits_cleared() {
        assert_eq!(EntityId::from_raw(0x1F_FFFF).raw_id(), 0xF_FFFF);
        assert_eq!(EntityId::from_bits(0xFF00_0001).bits(), 1);
        assert!(EntityId::NULL.is_null());
        assert!(EntityId::from_raw(1 << 20).is_null());
    }

    #[test]
    fn test_is_life_changed() {
        let a = EntityId::from_raw(3);
        let b = a.with_priority(Priority::Low);
        assert!(!EntityId::is_life_changed(a, b));
        assert!(EntityId::is_life_changed(a, a.with_life_state(LifeState::Alive)));
    }

    #[test]
    fn test_transition_table() {
        let id = EntityId::from_raw(9);
        for from in ALL_STATES {
            for to in ALL_STATES {
                let result = id.with_life_state(from).transition(to);
                let legal = from == to
                    || matches!(
                        (from, to),
                        (LifeState::Register, LifeState::Alive)
                            | (LifeState::Register, LifeState::Unregister)
                            | (LifeState::Alive, LifeState::Unregister)
                            | (LifeState::Unregister, LifeState::Destroyed)
                    );
                if legal {
                    assert_eq!(result.map(EntityId::life_state), Ok(to));
                } else {
                    assert_eq!(result, Err(IllegalTransition { from, to }));
                }
            }
        }
    }

    #[test]
    fn test_allocator_starts_at_one_and_recycles() {
        let allocator = EntityIdAllocator::new();
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(a.raw_id(), 1);
        assert_eq!(b.raw_id(), 2);
        assert_eq!(a.life_state(), LifeState::Register);
        assert_eq!(a.priority(), Priority::Normal);

        allocator.release(a.with_life_state(LifeState::Destroyed));
        let c = allocator.allocate().unwrap();
        assert_eq!(c, EntityId::from_raw(1));
        assert_eq!(allocator.live_count(), 2);
    }

    #[test]
    fn test_allocator_exhaustion_is_an_error() {
        let allocator = EntityIdAllocator::with_limit(2);
        allocator.allocate().unwrap();
        allocator.allocate().unwrap();
        assert_eq!(allocator.allocate(), Err(CapacityError { limit: 2 }));
    }
}
