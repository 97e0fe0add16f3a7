//! Outbound sessions: connected per-destination send channels.
//!
//! A session is a connected UDP socket owned by the worker that created it,
//! bound to the relay's client-facing source address. Relay logic holds only
//! a copyable [`Session`] handle (slot plus generation, so a reused slot
//! can't be confused with a stale handle) and issues sends through
//! [`WorkerCtx::start_send`](crate::worker::WorkerCtx::start_send).
//!
//! Sends never allocate: each one borrows a chunk of the worker's most
//! recently allocated receive buffer and rides in the pending queue until
//! the session socket accepts it.

use crate::buffer::{BufferId, Packet};
use std::net::SocketAddr;

/// Handle to an outbound session on the owning worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    slot: u32,
    generation: u32,
}

impl Session {
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        Self {
            slot: slot as u32,
            generation,
        }
    }

    #[inline]
    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

/// Worker-side state for one session.
pub(crate) struct SessionState {
    pub(crate) socket: mio::net::UdpSocket,
    pub(crate) dest: SocketAddr,
    pub(crate) generation: u32,
    /// Last known writability; cleared on `WouldBlock`, set again by the
    /// poll loop on a writable event.
    pub(crate) writable: bool,
}

/// One claimed send chunk: the outbound request riding in the worker's
/// pending queue until the session socket accepts it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendChunk {
    pub(crate) session: Session,
    pub(crate) packet: Packet,
    pub(crate) buf: BufferId,
}
