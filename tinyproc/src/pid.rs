//! Generation-stamped process identifiers.
//!
//! A [`Pid`] addresses one occupant of one slot of one [`ProcessQueue`]:
//! the slot index names the record, the generation distinguishes successive
//! occupants of that record, and the queue pointer routes the operation.
//! Slots are recycled, PIDs are not — once the slot's generation advances
//! past the one captured here, the PID is permanently dead and every send
//! through it reports [`SendResult::ActorIsDead`].
//!
//! The queue pointer is non-owning: holding a `Pid` keeps nothing alive.

use crate::process::{MessageAction, SendResult};
use crate::scheduler::ProcessQueue;

/// Address of a process: owning queue, slot index, slot generation.
///
/// Compared by equality of all three fields. Obtained from
/// [`ProcessQueue::spawn`], [`ProcessQueue::self_pid`] and
/// [`ProcessQueue::parent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pid {
    pub(crate) queue: *const ProcessQueue,
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

// SAFETY: a Pid is plain routing data. The pointer is only dereferenced by
// `send`, whose contract requires the queue to still be alive; copying the
// Pid across threads adds no hazard beyond that contract.
unsafe impl Send for Pid {}
// SAFETY: as above — shared references to a Pid expose no mutation.
unsafe impl Sync for Pid {}

impl Pid {
    /// Send `message` to the process this PID addresses.
    ///
    /// Never blocks. Returns [`SendResult::ActorIsDead`] when the slot has
    /// been recycled since this PID was minted, and [`SendResult::Fail`]
    /// when the destination is mid-termination or its mailbox is full; in
    /// the mailbox-full case `action` decides whether the message is kept
    /// by the caller or discarded through the mailbox's release callback.
    ///
    /// # Safety
    ///
    /// - The owning [`ProcessQueue`] must still be alive.
    /// - `message` must satisfy whatever contract the destination's
    ///   `message_release` callback and handler place on message pointers.
    #[must_use = "a failed send leaves message ownership with the caller"]
    pub unsafe fn send(self, message: *mut (), action: MessageAction) -> SendResult {
        // SAFETY: caller guarantees the owning queue outlives this call.
        unsafe { (*self.queue).send_to(self, message, action) }
    }
}
