//! The callback boundary between the I/O engine and relay logic.
//!
//! The engine moves opaque datagrams; relay logic decides what to forward
//! and where. Logic receives an explicit [`WorkerCtx`] execution-context
//! handle with every callback instead of relying on ambient thread-local
//! state, which makes the thread affinity of pools and sessions a
//! parameter-level contract.

use crate::buffer::Packet;
use crate::session::Session;
use crate::worker::WorkerCtx;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-worker relay logic callbacks.
///
/// One instance runs on each worker thread; callbacks within a worker are
/// invoked strictly one at a time.
pub trait RelayLogic: Send + 'static {
    /// A datagram arrived on the client-facing port. Notification only.
    fn on_client_received(&mut self, ctx: &mut WorkerCtx<'_>, src: SocketAddr, packet: Packet);

    /// A datagram arrived on the peer-facing port.
    ///
    /// Return `true` to retain the packet beyond this call; the engine then
    /// must not release the backing buffer on this receive pass. A retained
    /// buffer is freed later by the send-completion path or by an explicit
    /// [`WorkerCtx::release_packet`].
    fn on_peer_received(&mut self, ctx: &mut WorkerCtx<'_>, src: SocketAddr, packet: Packet)
        -> bool;

    /// A send previously issued through `start_send` completed.
    fn on_session_sent(&mut self, ctx: &mut WorkerCtx<'_>, session: Session, packet: Packet);
}

/// Factory handed to the relay engine: creates one logic instance per
/// worker and reports statistics from the engine thread.
pub trait RelayFactory: Send + Sync + 'static {
    type Logic: RelayLogic;

    fn create_for_worker(&self, worker_id: usize) -> Self::Logic;

    /// Invoked on each statistics tick. Reads shared state only; the tick
    /// runs on the engine thread and performs no buffer or session work.
    fn print_statistics(&self, interval: Duration) {
        let _ = interval;
    }
}
