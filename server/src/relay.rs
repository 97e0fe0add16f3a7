//! The relay engine: spawns one worker per thread and drives the
//! statistics timer from the engine thread.

use crate::config::Config;
use crate::workers::{join_workers, spawn_workers, WorkerHandle};
use relay_driver::{RelayFactory, Worker, WorkerConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of shutdown-flag checks on the engine thread.
const ENGINE_TICK: Duration = Duration::from_millis(100);

/// A running relay: worker threads plus their shared shutdown flag.
pub struct Relay {
    handles: Vec<WorkerHandle<()>>,
    shutdown: Arc<AtomicBool>,
    client_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Relay {
    /// Bind and spawn all workers.
    ///
    /// The first worker binds before the rest so a port 0 request resolves
    /// to one concrete port that every other worker then shares through
    /// `SO_REUSEPORT`.
    pub fn start<F: RelayFactory>(
        config: &Config,
        factory: Arc<F>,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let first = Worker::new(
            0,
            &WorkerConfig {
                client_addr: config.client_addr,
                peer_addr: config.peer_addr,
            },
        )?;
        let client_addr = first.local_client_addr();
        let peer_addr = first.local_peer_addr();
        let resolved = WorkerConfig {
            client_addr,
            peer_addr,
        };

        let mut workers = vec![first];
        for id in 1..config.threads {
            workers.push(Worker::new(id, &resolved)?);
        }

        tracing::info!(
            threads = config.threads,
            client = %client_addr,
            peer = %peer_addr,
            "relay listening"
        );

        let handles = {
            let factory = factory.clone();
            let shutdown_flag = shutdown.clone();
            spawn_workers(
                workers,
                config.cpu_affinity.as_deref(),
                "relay-worker",
                move |id, worker| {
                    let logic = factory.create_for_worker(id);
                    worker.run(logic, shutdown_flag.clone());
                },
            )
        };

        Ok(Self {
            handles,
            shutdown,
            client_addr,
            peer_addr,
        })
    }

    /// Actual client-facing address, with port 0 resolved.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Actual peer-facing address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Ask every worker to stop after its current poll iteration.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for all workers to exit.
    pub fn join(self) {
        join_workers(self.handles);
    }

    /// Drive the statistics timer until shutdown, then join the workers.
    pub fn run<F: RelayFactory>(self, factory: &F, interval: Option<Duration>) {
        run_statistics(factory, interval, &self.shutdown);
        self.join();
    }
}

/// Tick the statistics callback at `interval` until the shutdown flag is
/// set. The first tick fires immediately; with no interval this just
/// waits for shutdown.
fn run_statistics<F: RelayFactory>(
    factory: &F,
    interval: Option<Duration>,
    shutdown: &Arc<AtomicBool>,
) {
    if let Some(every) = interval {
        factory.print_statistics(every);
    }
    let mut deadline = interval.map(|i| Instant::now() + i);

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(ENGINE_TICK);
        if let (Some(at), Some(every)) = (deadline, interval) {
            if Instant::now() >= at {
                factory.print_statistics(every);
                deadline = Some(at + every);
            }
        }
    }
}
