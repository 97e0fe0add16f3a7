//! Event-loop transport core for a multi-threaded UDP relay.
//!
//! The crate runs one independent event loop per worker thread. Workers
//! share nothing: every thread binds its own pair of listener sockets to
//! the same two ports via `SO_REUSEPORT`, owns its own buffer pool and
//! session table, and the kernel shards traffic across threads. Datagrams
//! are received in batches into chunk regions of pooled buffers, relay
//! logic sees zero-copy [`Packet`] views, and outbound sends borrow chunks
//! of the buffer that was just filled.
//!
//! Applications implement [`RelayLogic`] (per-worker callbacks) and
//! [`RelayFactory`] (one logic instance per worker), then hand the factory
//! to a [`Worker`] or to the server crate's relay engine.

mod buffer;
mod buffer_pool;
mod logic;
mod session;
mod udp;
mod worker;

pub use buffer::{Buffer, BufferId, Packet, BUFFER_DATA_SIZE, CHUNKS_PER_BUFFER, CHUNK_DATA_SIZE};
pub use buffer_pool::BufferPool;
pub use logic::{RelayFactory, RelayLogic};
pub use session::Session;
pub use udp::{bind_listener, connect_session, set_reuse_port, MAX_BATCH};
pub use worker::{Worker, WorkerConfig, WorkerCtx};
