//! Per-thread pool of reusable receive/send buffers.
//!
//! Each worker thread owns exactly one pool; the pool is never shared or
//! locked. Released buffers go onto a free list and are reused LIFO, so the
//! hot path touches memory that is still warm in cache. When the free list is
//! empty the pool grows by constructing a new buffer - there is no upper
//! bound on live buffers.
//!
//! The pool also remembers the buffer most recently handed out by
//! [`allocate`](BufferPool::allocate). The send path always borrows chunks
//! from that buffer, which is what lets outbound traffic reuse just-received
//! memory without any additional allocation.

use crate::buffer::{Buffer, BufferId, Packet, CHUNKS_PER_BUFFER, CHUNK_DATA_SIZE};

/// A growable pool of fixed-layout buffers with LIFO reuse.
///
/// Not thread-safe by design: each worker owns its own pool.
pub struct BufferPool {
    /// Every buffer ever constructed, indexed by `BufferId`.
    buffers: Vec<Buffer>,
    /// Free list. Push/pop at the back for LIFO reuse.
    free: Vec<BufferId>,
    /// Buffer most recently returned by `allocate`.
    last_alloc: Option<BufferId>,
    chunk_capacity: usize,
    chunk_size: usize,
}

impl BufferPool {
    /// Create a pool with the platform default buffer layout.
    pub fn new() -> Self {
        Self::with_layout(CHUNKS_PER_BUFFER, CHUNK_DATA_SIZE)
    }

    /// Create a pool with an explicit chunk layout.
    pub fn with_layout(chunk_capacity: usize, chunk_size: usize) -> Self {
        Self {
            buffers: Vec::new(),
            free: Vec::new(),
            last_alloc: None,
            chunk_capacity,
            chunk_size,
        }
    }

    /// Take a buffer with reference count zero, growing the pool if the free
    /// list is empty. Records the result as the last allocation.
    pub fn allocate(&mut self) -> BufferId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                let id = BufferId::new(self.buffers.len());
                self.buffers
                    .push(Buffer::new(self.chunk_capacity, self.chunk_size));
                id
            }
        };
        self.buffers[id.as_usize()].reset();
        self.last_alloc = Some(id);
        id
    }

    /// Return a buffer to the free list.
    ///
    /// The caller guarantees the reference count is zero and no live packet
    /// view or in-flight send still aliases the buffer.
    pub fn release(&mut self, id: BufferId) {
        let buf = &self.buffers[id.as_usize()];
        assert!(
            buf.ref_count() == 0,
            "release of buffer with {} sends in flight",
            buf.ref_count()
        );
        debug_assert!(!self.free.contains(&id), "double release of buffer");
        self.free.push(id);
    }

    /// Release `id` if nothing references it. Returns whether it was
    /// released.
    pub fn release_if_unreferenced(&mut self, id: BufferId) -> bool {
        if self.buffers[id.as_usize()].ref_count() == 0 {
            self.release(id);
            true
        } else {
            false
        }
    }

    /// The buffer most recently returned by [`allocate`](Self::allocate).
    #[inline]
    pub fn last_alloc(&self) -> Option<BufferId> {
        self.last_alloc
    }

    #[inline]
    pub fn get(&self, id: BufferId) -> &Buffer {
        &self.buffers[id.as_usize()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: BufferId) -> &mut Buffer {
        &mut self.buffers[id.as_usize()]
    }

    /// Resolve a packet view to its bytes. Bounds-checked against the
    /// owning buffer's data area.
    pub fn packet_bytes(&self, packet: Packet) -> &[u8] {
        let data = self.buffers[packet.buffer().as_usize()].data();
        let start = packet.offset();
        let end = start + packet.len();
        assert!(end <= data.len(), "packet view out of buffer bounds");
        &data[start..end]
    }

    /// Build a packet view over a region of a buffer's data area.
    pub fn make_packet(&self, id: BufferId, offset: usize, len: usize) -> Packet {
        let data_len = self.buffers[id.as_usize()].data().len();
        assert!(offset + len <= data_len, "packet region out of bounds");
        Packet::new(id, offset, len)
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Total buffers ever constructed by this pool.
    #[inline]
    pub fn total_count(&self) -> usize {
        self.buffers.len()
    }

    /// Buffers currently on the free list.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Buffers currently outside the pool (held by a receive pass, a
    /// retention, or in-flight sends).
    #[inline]
    pub fn outstanding_count(&self) -> usize {
        self.buffers.len() - self.free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_grows_when_empty() {
        let mut pool = BufferPool::with_layout(1, 64);
        assert_eq!(pool.total_count(), 0);

        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);
        assert_eq!(pool.total_count(), 2);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_release_allocate_roundtrip_is_lifo() {
        let mut pool = BufferPool::with_layout(1, 64);
        let a = pool.allocate();
        let b = pool.allocate();

        pool.release(a);
        pool.release(b);

        // Most recently released comes back first.
        assert_eq!(pool.allocate(), b);
        assert_eq!(pool.allocate(), a);
    }

    #[test]
    fn test_last_alloc_tracks_most_recent() {
        let mut pool = BufferPool::with_layout(1, 64);
        assert!(pool.last_alloc().is_none());

        let a = pool.allocate();
        assert_eq!(pool.last_alloc(), Some(a));

        let b = pool.allocate();
        assert_eq!(pool.last_alloc(), Some(b));
    }

    #[test]
    fn test_allocate_resets_ref_count() {
        let mut pool = BufferPool::with_layout(2, 64);
        let a = pool.allocate();
        pool.get_mut(a).claim_chunk();
        pool.get_mut(a).complete_chunk();
        pool.release(a);

        let b = pool.allocate();
        assert_eq!(a, b);
        assert_eq!(pool.get(b).ref_count(), 0);
    }

    #[test]
    #[should_panic(expected = "sends in flight")]
    fn test_release_with_refs_is_fatal() {
        let mut pool = BufferPool::with_layout(2, 64);
        let a = pool.allocate();
        pool.get_mut(a).claim_chunk();
        pool.release(a);
    }

    #[test]
    fn test_release_if_unreferenced() {
        let mut pool = BufferPool::with_layout(2, 64);
        let a = pool.allocate();
        pool.get_mut(a).claim_chunk();
        assert!(!pool.release_if_unreferenced(a));
        assert_eq!(pool.free_count(), 0);

        pool.get_mut(a).complete_chunk();
        assert!(pool.release_if_unreferenced(a));
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_packet_bytes_resolves_region() {
        let mut pool = BufferPool::with_layout(2, 8);
        let a = pool.allocate();
        pool.get_mut(a).chunk_mut(1).copy_from_slice(b"datagram");

        let packet = pool.make_packet(a, 8, 8);
        assert_eq!(pool.packet_bytes(packet), b"datagram");
        assert_eq!(packet.buffer(), a);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_packet_out_of_bounds_is_fatal() {
        let mut pool = BufferPool::with_layout(1, 8);
        let a = pool.allocate();
        pool.make_packet(a, 4, 8);
    }
}
