//! Built-in echo relay logic.
//!
//! Client traffic is counted only. Peer datagrams are sent back to their
//! source through a per-source session, which exercises the whole outbound
//! path: session setup, chunk borrowing, send completion. Useful as a
//! traffic generator target and as the default behavior of `relayd`.

use crate::metrics::RelayStats;
use relay_driver::{Packet, RelayFactory, RelayLogic, Session, WorkerCtx};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on cached sessions per worker. Peers beyond the limit have
/// their datagrams dropped instead of growing the session table without
/// bound.
pub const DEFAULT_SESSION_LIMIT: usize = 4096;

/// Per-worker echo logic. Sessions are cached per peer source address, up
/// to the configured limit.
pub struct EchoRelay {
    stats: Arc<RelayStats>,
    sessions: HashMap<SocketAddr, Session>,
    session_limit: usize,
}

impl EchoRelay {
    fn new(stats: Arc<RelayStats>, session_limit: usize) -> Self {
        Self {
            stats,
            sessions: HashMap::new(),
            session_limit,
        }
    }

    fn session_for(&mut self, ctx: &mut WorkerCtx<'_>, src: SocketAddr) -> Option<Session> {
        if let Some(session) = self.sessions.get(&src) {
            return Some(*session);
        }
        if self.sessions.len() >= self.session_limit {
            tracing::warn!(worker = ctx.worker_id(), %src, "session limit reached, dropping");
            return None;
        }
        match ctx.open_session(src) {
            Ok(session) => {
                self.sessions.insert(src, session);
                Some(session)
            }
            Err(e) => {
                tracing::warn!(worker = ctx.worker_id(), %src, error = %e, "session open failed");
                None
            }
        }
    }
}

impl RelayLogic for EchoRelay {
    fn on_client_received(&mut self, ctx: &mut WorkerCtx<'_>, _src: SocketAddr, packet: Packet) {
        self.stats.record_client(ctx.packet_bytes(packet).len());
    }

    fn on_peer_received(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        src: SocketAddr,
        packet: Packet,
    ) -> bool {
        self.stats.record_peer(ctx.packet_bytes(packet).len());
        if let Some(session) = self.session_for(ctx, src) {
            ctx.start_send(session, packet);
        }
        // The queued send holds a buffer reference; no extra retention.
        false
    }

    fn on_session_sent(&mut self, _ctx: &mut WorkerCtx<'_>, _session: Session, packet: Packet) {
        self.stats.record_sent(packet.len());
    }
}

/// Factory for [`EchoRelay`]: one logic instance per worker, shared
/// counters across all of them.
pub struct EchoFactory {
    stats: Arc<RelayStats>,
    session_limit: usize,
}

impl EchoFactory {
    pub fn new() -> Self {
        Self::with_session_limit(DEFAULT_SESSION_LIMIT)
    }

    pub fn with_session_limit(session_limit: usize) -> Self {
        Self {
            stats: Arc::new(RelayStats::new()),
            session_limit,
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }
}

impl Default for EchoFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayFactory for EchoFactory {
    type Logic = EchoRelay;

    fn create_for_worker(&self, _worker_id: usize) -> EchoRelay {
        EchoRelay::new(self.stats.clone(), self.session_limit)
    }

    fn print_statistics(&self, interval: Duration) {
        self.stats.report(interval);
    }
}
