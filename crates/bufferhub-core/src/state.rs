//! Per-client buffer state and fence state words
//!
//! `buffer_state` packs one 2-bit slot per client: the client at bit index
//! `i` owns bits `2i..=2i+1`. Every update reads the whole word, rewrites
//! only the caller's slot and compare-and-swaps the word back, so concurrent
//! updates to different slots never overwrite each other.

use crate::clients::{ClientBit, CLIENT_BITS_MASK};
use crate::{Error, Result};
use crate::sync::{AtomicU32, Ordering};

const SLOT_BITS: u32 = 2;
const SLOT_MASK: u32 = 0b11;

/// Life-cycle phase held by one client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BufferState {
    /// Done with the buffer; a producer may gain it again
    Released = 0b00,
    /// A consumer is reading
    Acquired = 0b01,
    /// Content published for consumers
    Posted = 0b10,
    /// Exclusive write access
    Gained = 0b11,
}

impl BufferState {
    const fn from_bits(bits: u32) -> Self {
        match bits & SLOT_MASK {
            0b00 => BufferState::Released,
            0b01 => BufferState::Acquired,
            0b10 => BufferState::Posted,
            _ => BufferState::Gained,
        }
    }

    /// State a slot must be in before it can move to `self`
    pub const fn predecessor(self) -> BufferState {
        match self {
            BufferState::Gained => BufferState::Released,
            BufferState::Posted => BufferState::Gained,
            BufferState::Acquired => BufferState::Posted,
            BufferState::Released => BufferState::Acquired,
        }
    }

    pub const fn can_transition_to(self, next: BufferState) -> bool {
        next.predecessor() as u32 == self as u32
    }
}

const fn slot_shift(bit: ClientBit) -> u32 {
    bit.index() * SLOT_BITS
}

/// Extract one client's state from a raw `buffer_state` value
pub const fn state_in(word: u32, bit: ClientBit) -> BufferState {
    BufferState::from_bits(word >> slot_shift(bit))
}

const fn with_state(word: u32, bit: ClientBit, state: BufferState) -> u32 {
    let shift = slot_shift(bit);
    (word & !(SLOT_MASK << shift)) | ((state as u32) << shift)
}

/// View over the `buffer_state` word
#[derive(Clone, Copy)]
pub struct BufferStateWord<'a> {
    word: &'a AtomicU32,
}

impl<'a> BufferStateWord<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Raw word, acquire load
    pub fn load(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// State of one client slot. Only meaningful while the client is
    /// registered; liveness is not checked here.
    pub fn client_state(&self, bit: ClientBit) -> BufferState {
        state_in(self.load(), bit)
    }

    /// Move `bit`'s slot from `expected` to `new`.
    ///
    /// Retries while other slots change underneath; fails with the observed
    /// state as soon as this slot is not `expected`.
    pub fn compare_and_set(
        &self,
        bit: ClientBit,
        expected: BufferState,
        new: BufferState,
    ) -> std::result::Result<(), BufferState> {
        let mut current = self.load();
        loop {
            let actual = state_in(current, bit);
            if actual != expected {
                return Err(actual);
            }
            match self.word.compare_exchange_weak(
                current,
                with_state(current, bit, new),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Unconditionally set one slot, returning its previous state
    pub fn store(&self, bit: ClientBit, state: BufferState) -> BufferState {
        let mut current = self.load();
        loop {
            match self.word.compare_exchange_weak(
                current,
                with_state(current, bit, state),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(previous) => return state_in(previous, bit),
                Err(observed) => current = observed,
            }
        }
    }

    /// Step the slot along gained -> posted -> acquired -> released -> gained
    pub fn advance(&self, bit: ClientBit, to: BufferState) -> Result<()> {
        self.compare_and_set(bit, to.predecessor(), to)
            .map_err(|from| Error::InvalidTransition { from, to })
    }

    pub fn gain(&self, bit: ClientBit) -> Result<()> {
        self.advance(bit, BufferState::Gained)
    }

    pub fn post(&self, bit: ClientBit) -> Result<()> {
        self.advance(bit, BufferState::Posted)
    }

    pub fn acquire(&self, bit: ClientBit) -> Result<()> {
        self.advance(bit, BufferState::Acquired)
    }

    pub fn release(&self, bit: ClientBit) -> Result<()> {
        self.advance(bit, BufferState::Released)
    }

    /// Mask of the clients in `active_mask` whose slot holds `state`.
    ///
    /// The state word and `active_mask` are separate loads; the result is
    /// not a combined snapshot.
    pub fn clients_in(&self, state: BufferState, active_mask: u32) -> u32 {
        let word = self.load();
        let mut remaining = active_mask & CLIENT_BITS_MASK;
        let mut matched = 0;
        while remaining != 0 {
            let mask = remaining & remaining.wrapping_neg();
            remaining &= !mask;
            if let Some(bit) = ClientBit::from_mask(mask) {
                if state_in(word, bit) == state {
                    matched |= mask;
                }
            }
        }
        matched
    }

    pub fn any_client_in(&self, state: BufferState, active_mask: u32) -> bool {
        self.clients_in(state, active_mask) != 0
    }
}

/// View over the `fence_state` word: one bit per client with a pending fence
#[derive(Clone, Copy)]
pub struct FenceStateWord<'a> {
    word: &'a AtomicU32,
}

impl<'a> FenceStateWord<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    pub fn load(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    pub fn is_pending(&self, bit: ClientBit) -> bool {
        self.load() & bit.mask() != 0
    }

    /// Mark a fence pending for `bit`; returns whether one already was
    pub fn set_pending(&self, bit: ClientBit) -> bool {
        self.word.fetch_or(bit.mask(), Ordering::AcqRel) & bit.mask() != 0
    }

    /// Clear `bit`'s pending fence once it has signaled. Only the owning
    /// client clears its own bit.
    pub fn clear(&self, bit: ClientBit) -> bool {
        self.word.fetch_and(!bit.mask(), Ordering::AcqRel) & bit.mask() != 0
    }
}
