//! Client identity allocation over the shared active-clients word
//!
//! Every client of a buffer owns one bit of a 16-bit identity space. The set
//! of registered clients is a single atomic word in the metadata header, so
//! registration is a compare-and-swap on that word and never takes a lock.

use crate::sync::{AtomicU32, Ordering};

/// Maximum number of clients registered on one buffer at a time
pub const MAX_CLIENTS: u32 = 16;

/// Bits of the active-clients word that can hold a client
pub const CLIENT_BITS_MASK: u32 = (1 << MAX_CLIENTS) - 1;

/// A single client identity bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientBit(u32);

impl ClientBit {
    /// Bit for the client at `index` (0..16)
    pub const fn from_index(index: u32) -> Option<Self> {
        if index < MAX_CLIENTS {
            Some(Self(1 << index))
        } else {
            None
        }
    }

    /// Accept a mask only if it is exactly one bit inside the client range
    pub const fn from_mask(mask: u32) -> Option<Self> {
        if mask.is_power_of_two() && mask & CLIENT_BITS_MASK != 0 {
            Some(Self(mask))
        } else {
            None
        }
    }

    /// Single-bit mask value, e.g. `0x4` for index 2
    pub const fn mask(self) -> u32 {
        self.0
    }

    /// Bit position, used to locate the client's state slot
    pub const fn index(self) -> u32 {
        self.0.trailing_zeros()
    }
}

/// Lowest clear bit of `mask` inside the client range
fn lowest_free_bit(mask: u32) -> Option<ClientBit> {
    let free = !mask & CLIENT_BITS_MASK;
    if free == 0 {
        None
    } else {
        Some(ClientBit(free & free.wrapping_neg()))
    }
}

/// View over the `active_clients_bit_mask` word
#[derive(Clone, Copy)]
pub struct ActiveClients<'a> {
    word: &'a AtomicU32,
}

impl<'a> ActiveClients<'a> {
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Current mask.
    ///
    /// Acquire load: every registration or removal whose release completed
    /// before this call is visible. This says nothing about the state or
    /// fence words, which must be loaded separately.
    pub fn mask(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Register a new client on the lowest free bit.
    ///
    /// Returns `None` when all [`MAX_CLIENTS`] bits are taken. A failed
    /// compare-and-swap means another participant changed the mask, so the
    /// loop re-derives the free bit from the observed value. Without
    /// concurrent removals each retry consumes a bit, which bounds the loop
    /// at [`MAX_CLIENTS`] iterations before it reports the pool full.
    pub fn add_new_client(&self) -> Option<ClientBit> {
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            let bit = lowest_free_bit(current)?;
            match self.word.compare_exchange(
                current,
                current | bit.mask(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(bit),
                Err(observed) => current = observed,
            }
        }
    }

    /// Clear a client's bit with release ordering.
    ///
    /// Must be called at most once per successful [`add_new_client`]; a
    /// second call could clear the bit of a later client that reused it.
    ///
    /// [`add_new_client`]: ActiveClients::add_new_client
    pub fn remove_client(&self, bit: ClientBit) {
        self.word.fetch_and(!bit.mask(), Ordering::Release);
    }

    pub fn contains(&self, bit: ClientBit) -> bool {
        self.mask() & bit.mask() != 0
    }

    /// Number of registered clients
    pub fn count(&self) -> u32 {
        (self.mask() & CLIENT_BITS_MASK).count_ones()
    }
}
