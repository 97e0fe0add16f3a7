//! Worker thread management utilities.

use crate::affinity::set_cpu_affinity;
use std::thread::{self, JoinHandle};

/// Handle to a spawned worker thread.
pub struct WorkerHandle<R> {
    pub handle: JoinHandle<R>,
    /// 0-indexed worker id.
    pub worker_id: usize,
    /// CPU the worker is pinned to, if any.
    pub cpu_id: Option<usize>,
}

/// Spawn one named thread per item, with optional CPU affinity.
///
/// Each item is moved into its thread; `worker_fn` receives the worker id
/// and the item. Workers that cannot pin log a warning and keep running
/// unpinned.
pub fn spawn_workers<T, F, R>(
    items: Vec<T>,
    cpu_affinity: Option<&[usize]>,
    name_prefix: &str,
    worker_fn: F,
) -> Vec<WorkerHandle<R>>
where
    T: Send + 'static,
    F: Fn(usize, T) -> R + Send + Clone + 'static,
    R: Send + 'static,
{
    let mut handles = Vec::with_capacity(items.len());

    for (worker_id, item) in items.into_iter().enumerate() {
        let cpu_id = cpu_affinity.map(|cpus| cpus[worker_id % cpus.len()]);
        let worker_fn = worker_fn.clone();
        let thread_name = format!("{}-{}", name_prefix, worker_id);

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                if let Some(cpu) = cpu_id {
                    if let Err(e) = set_cpu_affinity(cpu) {
                        tracing::warn!(worker = worker_id, error = %e, "cpu pinning failed");
                    }
                }
                worker_fn(worker_id, item)
            })
            .expect("failed to spawn worker thread");

        handles.push(WorkerHandle {
            handle,
            worker_id,
            cpu_id,
        });
    }

    handles
}

/// Wait for all worker threads to complete.
pub fn join_workers<R>(handles: Vec<WorkerHandle<R>>) -> Vec<R> {
    handles
        .into_iter()
        .map(|h| h.handle.join().expect("worker thread panicked"))
        .collect()
}
