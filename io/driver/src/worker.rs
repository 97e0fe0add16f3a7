//! Per-thread event loop: receive dispatch and the pending-send queue.
//!
//! Each worker owns one mio poll instance, one client-facing and one
//! peer-facing listener socket (all workers bind the same two ports with
//! `SO_REUSEPORT`, so the kernel shards incoming traffic), one buffer pool,
//! and a table of outbound sessions. Nothing a worker owns is ever touched
//! from another thread; within a worker, callbacks run strictly one at a
//! time.
//!
//! A receive pass allocates one pool buffer, drains a batch of datagrams
//! into its chunk regions, and dispatches one relay-logic callback per
//! datagram. Sends issued during dispatch borrow chunks of that same buffer
//! and ride the pending queue; they are flushed once dispatch finishes and
//! again whenever a session socket turns writable. The buffer returns to
//! the pool when the final datagram's post-processing finds it unretained
//! and unreferenced, or when the last outstanding send completes.

use crate::buffer::{BufferId, Packet};
use crate::buffer_pool::BufferPool;
use crate::logic::RelayLogic;
use crate::session::{SendChunk, Session, SessionState};
use crate::udp::{self, RecvMeta, MAX_BATCH};
use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CLIENT: Token = Token(0);
const PEER: Token = Token(1);

/// Token offset for session sockets to avoid collision with the listeners.
const SESSION_TOKEN_OFFSET: usize = 1 << 16;

/// Poll timeout between shutdown-flag checks in [`Worker::run`].
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Listening role a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Peer,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Peer => "peer",
        }
    }
}

/// Listening addresses for one worker. All workers of a relay share the
/// same two ports.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub client_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// One relay worker: event loop, listener sockets, buffer pool, sessions.
pub struct Worker {
    id: usize,
    poll: Poll,
    events: Events,
    #[allow(dead_code)]
    client: MioUdpSocket,
    #[allow(dead_code)]
    peer: MioUdpSocket,
    client_fd: RawFd,
    peer_fd: RawFd,
    local_client: SocketAddr,
    local_peer: SocketAddr,
    /// Source address for outbound sessions: any address on the
    /// client-facing port.
    session_bind: SocketAddr,
    pool: BufferPool,
    sessions: Slab<SessionState>,
    next_generation: u32,
    pending: VecDeque<SendChunk>,
}

impl Worker {
    /// Create a worker with the platform default buffer layout.
    pub fn new(id: usize, config: &WorkerConfig) -> io::Result<Self> {
        let pool = BufferPool::new();
        Self::with_pool(id, config, pool)
    }

    /// Create a worker with an explicit buffer layout. Used by tests to
    /// force small chunk capacities.
    pub fn with_pool_layout(
        id: usize,
        config: &WorkerConfig,
        chunk_capacity: usize,
        chunk_size: usize,
    ) -> io::Result<Self> {
        Self::with_pool(id, config, BufferPool::with_layout(chunk_capacity, chunk_size))
    }

    fn with_pool(id: usize, config: &WorkerConfig, pool: BufferPool) -> io::Result<Self> {
        let poll = Poll::new()?;

        let client_std = udp::bind_listener(config.client_addr)?;
        let peer_std = udp::bind_listener(config.peer_addr)?;
        let local_client = client_std.local_addr()?;
        let local_peer = peer_std.local_addr()?;
        let client_fd = client_std.as_raw_fd();
        let peer_fd = peer_std.as_raw_fd();

        let mut client = MioUdpSocket::from_std(client_std);
        let mut peer = MioUdpSocket::from_std(peer_std);
        poll.registry()
            .register(&mut client, CLIENT, Interest::READABLE)?;
        poll.registry()
            .register(&mut peer, PEER, Interest::READABLE)?;

        let any: IpAddr = match local_client {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let session_bind = SocketAddr::new(any, local_client.port());

        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(1024),
            client,
            peer,
            client_fd,
            peer_fd,
            local_client,
            local_peer,
            session_bind,
            pool,
            sessions: Slab::with_capacity(64),
            next_generation: 0,
            pending: VecDeque::with_capacity(64),
        })
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Actual bound client-facing address (resolves port 0).
    #[inline]
    pub fn local_client_addr(&self) -> SocketAddr {
        self.local_client
    }

    /// Actual bound peer-facing address.
    #[inline]
    pub fn local_peer_addr(&self) -> SocketAddr {
        self.local_peer
    }

    #[inline]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Sends claimed but not yet accepted by a session socket.
    #[inline]
    pub fn pending_send_count(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Execution-context handle for pool and session operations outside a
    /// callback, e.g. releasing a retained packet from a test harness.
    pub fn ctx(&mut self) -> WorkerCtx<'_> {
        WorkerCtx {
            worker_id: self.id,
            pool: &mut self.pool,
            sessions: &mut self.sessions,
            registry: self.poll.registry(),
            pending: &mut self.pending,
            next_generation: &mut self.next_generation,
            session_bind: self.session_bind,
        }
    }

    /// Run the event loop until the shutdown flag is set.
    ///
    /// Any I/O error surfacing here is fatal: the worker panics with the
    /// failing operation and the process dies under its supervisor.
    pub fn run<L: RelayLogic>(mut self, mut logic: L, shutdown: Arc<AtomicBool>) {
        tracing::debug!(
            worker = self.id,
            client = %self.local_client,
            peer = %self.local_peer,
            "worker listening"
        );
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(e) = self.poll_once(&mut logic, Some(POLL_TIMEOUT)) {
                panic!("worker {}: poll: {}", self.id, e);
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    /// One poll iteration: wait for readiness, run receive dispatch, flush
    /// pending sends. Returns the number of readiness events handled.
    pub fn poll_once<L: RelayLogic>(
        &mut self,
        logic: &mut L,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }

        // Collect event info first to avoid borrow issues.
        let events: Vec<(usize, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token().0, e.is_readable(), e.is_writable()))
            .collect();
        let count = events.len();

        for (token, readable, writable) in events {
            if token == CLIENT.0 {
                if readable {
                    self.drain_listener(Role::Client, logic);
                }
            } else if token == PEER.0 {
                if readable {
                    self.drain_listener(Role::Peer, logic);
                }
            } else if token >= SESSION_TOKEN_OFFSET {
                if writable {
                    if let Some(sess) = self.sessions.get_mut(token - SESSION_TOKEN_OFFSET) {
                        sess.writable = true;
                    }
                }
            }
        }

        self.flush_pending(logic);
        Ok(count)
    }

    /// Drain one listener until `WouldBlock`: allocate a buffer, receive a
    /// batch into it, dispatch, decide the buffer's fate.
    fn drain_listener<L: RelayLogic>(&mut self, role: Role, logic: &mut L) {
        let fd = match role {
            Role::Client => self.client_fd,
            Role::Peer => self.peer_fd,
        };

        loop {
            // The only allocation path: one pool buffer per receive batch.
            let buf_id = self.pool.allocate();
            let mut metas = [RecvMeta::EMPTY; MAX_BATCH];

            let received = {
                let buf = self.pool.get_mut(buf_id);
                udp::recv_batch(fd, buf, &mut metas)
            };

            let n = match received {
                Ok(n) => n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    self.pool.release(buf_id);
                    return;
                }
                Err(e) => panic!("{}: recv_batch: {}", role.name(), e),
            };

            if n == 0 {
                self.pool.release(buf_id);
                return;
            }

            self.dispatch_batch(role, buf_id, &metas[..n], logic);
        }
    }

    /// Dispatch one received batch to relay logic, one callback per
    /// datagram, then make the release decision for the backing buffer.
    fn dispatch_batch<L: RelayLogic>(
        &mut self,
        role: Role,
        buf_id: BufferId,
        metas: &[RecvMeta],
        logic: &mut L,
    ) {
        let chunk_size = self.pool.chunk_size();
        let mut retained = false;

        for (i, meta) in metas.iter().enumerate() {
            // A zero-length completion carries nothing to deliver; it only
            // participates in buffer bookkeeping.
            if meta.len == 0 {
                continue;
            }
            let packet = Packet::new(buf_id, i * chunk_size, meta.len);
            let mut ctx = self.ctx();
            match role {
                Role::Client => logic.on_client_received(&mut ctx, meta.source, packet),
                Role::Peer => retained |= logic.on_peer_received(&mut ctx, meta.source, packet),
            }
        }

        // Final-chunk release decision: the buffer goes back to the pool
        // only if logic did not retain a packet from it and no send has
        // borrowed a chunk. Otherwise the send-completion path (or an
        // explicit release) frees it later.
        if !retained {
            self.pool.release_if_unreferenced(buf_id);
        }
    }

    /// Try to push every pending send chunk out through its session socket.
    /// A successful send is the completion: notify logic, drop the chunk's
    /// buffer reference, release the buffer at zero.
    fn flush_pending<L: RelayLogic>(&mut self, logic: &mut L) {
        loop {
            let mut queue = std::mem::take(&mut self.pending);
            let mut blocked: VecDeque<SendChunk> = VecDeque::new();
            let mut sent_any = false;

            while let Some(chunk) = queue.pop_front() {
                enum Outcome {
                    Sent,
                    Blocked,
                    Stale,
                }

                let outcome = match self.sessions.get_mut(chunk.session.slot()) {
                    Some(sess) if sess.generation == chunk.session.generation() => {
                        if !sess.writable {
                            Outcome::Blocked
                        } else {
                            let data = self.pool.packet_bytes(chunk.packet);
                            match sess.socket.send(data) {
                                Ok(_) => Outcome::Sent,
                                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                    sess.writable = false;
                                    Outcome::Blocked
                                }
                                Err(e) => panic!("session: send to {}: {}", sess.dest, e),
                            }
                        }
                    }
                    _ => Outcome::Stale,
                };

                match outcome {
                    Outcome::Sent => {
                        sent_any = true;
                        let mut ctx = self.ctx();
                        logic.on_session_sent(&mut ctx, chunk.session, chunk.packet);
                        if self.pool.get_mut(chunk.buf).complete_chunk() == 0 {
                            self.pool.release(chunk.buf);
                        }
                    }
                    Outcome::Blocked => blocked.push_back(chunk),
                    Outcome::Stale => {
                        tracing::warn!(worker = self.id, "dropping send on closed session");
                        if self.pool.get_mut(chunk.buf).complete_chunk() == 0 {
                            self.pool.release(chunk.buf);
                        }
                    }
                }
            }

            // Blocked chunks retry ahead of anything completions enqueued.
            while let Some(chunk) = blocked.pop_back() {
                self.pending.push_front(chunk);
            }

            if !sent_any || self.pending.is_empty() {
                break;
            }
        }
    }
}

/// Execution-context handle passed into every relay-logic callback.
///
/// Carries the worker's pool, session table, and pending-send queue as an
/// explicit parameter, making thread affinity a type-level contract: a ctx
/// only exists inside its worker's own callbacks.
pub struct WorkerCtx<'a> {
    worker_id: usize,
    pool: &'a mut BufferPool,
    sessions: &'a mut Slab<SessionState>,
    registry: &'a Registry,
    pending: &'a mut VecDeque<SendChunk>,
    next_generation: &'a mut u32,
    session_bind: SocketAddr,
}

impl WorkerCtx<'_> {
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Resolve a packet view to its bytes.
    #[inline]
    pub fn packet_bytes(&self, packet: Packet) -> &[u8] {
        self.pool.packet_bytes(packet)
    }

    /// Open an outbound session: a connected socket bound to the relay's
    /// client-facing source address.
    pub fn open_session(&mut self, dest: SocketAddr) -> io::Result<Session> {
        let std_sock = udp::connect_session(self.session_bind, dest)?;
        let mut socket = MioUdpSocket::from_std(std_sock);

        let entry = self.sessions.vacant_entry();
        let slot = entry.key();
        let generation = *self.next_generation;
        *self.next_generation = (*self.next_generation).wrapping_add(1);

        self.registry.register(
            &mut socket,
            Token(slot + SESSION_TOKEN_OFFSET),
            Interest::WRITABLE,
        )?;

        entry.insert(SessionState {
            socket,
            dest,
            generation,
            writable: true,
        });

        Ok(Session::new(slot, generation))
    }

    /// Close a session. Safe to call with a stale handle.
    pub fn close_session(&mut self, session: Session) -> io::Result<()> {
        match self.sessions.get(session.slot()) {
            Some(sess) if sess.generation == session.generation() => {}
            _ => return Ok(()),
        }
        if let Some(mut state) = self.sessions.try_remove(session.slot()) {
            self.registry.deregister(&mut state.socket)?;
        }
        Ok(())
    }

    /// Destination a session is connected to, if the handle is current.
    pub fn session_dest(&self, session: Session) -> Option<SocketAddr> {
        self.sessions
            .get(session.slot())
            .filter(|s| s.generation == session.generation())
            .map(|s| s.dest)
    }

    /// Queue a send of `packet` through `session`, borrowing a chunk from
    /// the most recently allocated buffer.
    ///
    /// Must be invoked from within the owning worker's callback context;
    /// claiming past the buffer's chunk capacity is fatal.
    pub fn start_send(&mut self, session: Session, packet: Packet) {
        let buf_id = match self.pool.last_alloc() {
            Some(id) => id,
            None => panic!("start_send: no receive buffer allocated on this worker"),
        };
        let _chunk = self.pool.get_mut(buf_id).claim_chunk();
        self.pending.push_back(SendChunk {
            session,
            packet,
            buf: buf_id,
        });
    }

    /// Explicitly release the buffer backing a previously retained packet.
    /// Returns whether it went back to the pool (it stays out while sends
    /// are still in flight).
    pub fn release_packet(&mut self, packet: Packet) -> bool {
        self.pool.release_if_unreferenced(packet.buffer())
    }
}
