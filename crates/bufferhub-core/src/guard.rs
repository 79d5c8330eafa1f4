//! RAII client registration

use crate::clients::ClientBit;
use crate::node::BufferNode;
use crate::state::BufferState;
use crate::Result;

/// A live client registration on a buffer node
///
/// Dropping the guard resets the client's state slot to released, clears its
/// fence bit and then removes its bit from the active mask, so the bit is
/// removed exactly once.
pub struct ClientGuard<'a> {
    node: &'a BufferNode,
    bit: ClientBit,
    /// Whether this guard owns the removal responsibility
    should_remove: bool,
}

impl<'a> ClientGuard<'a> {
    pub(crate) fn new(node: &'a BufferNode, bit: ClientBit) -> Self {
        Self {
            node,
            bit,
            should_remove: true,
        }
    }

    pub fn bit(&self) -> ClientBit {
        self.bit
    }

    pub fn node(&self) -> &'a BufferNode {
        self.node
    }

    /// This client's current slot state
    pub fn state(&self) -> BufferState {
        self.node.buffer_state().client_state(self.bit)
    }

    pub fn gain(&self) -> Result<()> {
        self.node.buffer_state().gain(self.bit)
    }

    pub fn post(&self) -> Result<()> {
        self.node.buffer_state().post(self.bit)
    }

    pub fn acquire(&self) -> Result<()> {
        self.node.buffer_state().acquire(self.bit)
    }

    pub fn release(&self) -> Result<()> {
        self.node.buffer_state().release(self.bit)
    }

    /// Mark a fence pending before attaching one to the buffer
    pub fn set_fence_pending(&self) -> bool {
        self.node.fence_state().set_pending(self.bit)
    }

    /// Clear this client's fence bit once the fence has signaled
    pub fn clear_fence(&self) -> bool {
        self.node.fence_state().clear(self.bit)
    }

    pub fn fence_pending(&self) -> bool {
        self.node.fence_state().is_pending(self.bit)
    }

    /// Keep the registration alive past this guard.
    /// Used when handing the client bit to another process, which then
    /// becomes responsible for removing it.
    pub fn forget(mut self) -> ClientBit {
        self.should_remove = false;
        self.bit
    }
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        if !self.should_remove {
            return;
        }
        self.node
            .buffer_state()
            .store(self.bit, BufferState::Released);
        self.node.fence_state().clear(self.bit);
        self.node.remove_clients_bit_from_mask(self.bit);
    }
}
