//! MPI transport for cross-rank boundary exchange.
//!
//! Sends use MPI's buffered mode, so posting a message returns as soon as
//! the payload is copied into the attached buffer; receives are
//! non-blocking matched probes keyed by `(source rank, tag)`. Message
//! ordering between one pair of endpoints is FIFO per tag, which is all the
//! exchange relies on: every buffer carries its own tag.

use std::fmt;

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::Real;

/// The tag upper bound every MPI implementation must support.
const TAG_UB_FLOOR: i32 = 32767;

/// Cross-rank message transport over a duplicated communicator.
pub struct MpiTransport {
    comm: SimpleCommunicator,
    tag_ub: i32,
}

impl fmt::Debug for MpiTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiTransport")
            .field("rank", &self.comm.rank())
            .field("size", &self.comm.size())
            .field("tag_ub", &self.tag_ub)
            .finish()
    }
}

impl MpiTransport {
    /// Wrap a communicator for exchange use.
    ///
    /// The communicator is duplicated so exchange traffic cannot collide
    /// with application messages. The caller must attach a buffer large
    /// enough for one exchange's outgoing messages (buffered-mode sends).
    pub fn new(comm: &SimpleCommunicator) -> Self {
        Self {
            comm: comm.duplicate(),
            tag_ub: TAG_UB_FLOOR,
        }
    }

    /// This process's rank in the transport communicator.
    pub fn rank(&self) -> i32 {
        self.comm.rank()
    }

    /// Number of ranks in the transport communicator.
    pub fn size(&self) -> i32 {
        self.comm.size()
    }

    /// The modulus of the tag space.
    pub(crate) fn tag_ub(&self) -> i32 {
        self.tag_ub
    }

    /// Post one buffer to a peer. Returns once the payload is buffered.
    pub(crate) fn post_send(&mut self, rank: i32, tag: i32, buf: &[Real]) {
        self.comm
            .process_at_rank(rank)
            .buffered_send_with_tag(buf, tag);
    }

    /// Receive one buffer from a peer if a matching message has arrived.
    pub(crate) fn try_recv(&mut self, rank: i32, tag: i32, buf: &mut [Real]) -> bool {
        match self
            .comm
            .process_at_rank(rank)
            .immediate_matched_probe_with_tag(tag)
        {
            Some((msg, _)) => {
                msg.matched_receive_into(buf);
                true
            }
            None => false,
        }
    }
}
