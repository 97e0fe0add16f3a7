//! Reference-counted receive/send buffers.
//!
//! A [`Buffer`] is a fixed-size memory block that serves two roles over its
//! lifetime: the kernel writes received datagrams into it (one per chunk
//! region when batched receive is active), and outbound sends borrow chunk
//! slots from it so replies can go out of the same memory that was just
//! filled, with no extra allocation or copy.
//!
//! Buffers are identified by a [`BufferId`] and always accessed through the
//! worker's [`BufferPool`](crate::buffer_pool::BufferPool). A [`Packet`] is a
//! non-owning `(buffer, offset, len)` view resolved against that pool.

/// Number of chunk slots per buffer.
///
/// With batched receive (Linux `recvmmsg`) one buffer can carry up to 32
/// datagrams per syscall; elsewhere a buffer holds a single datagram.
#[cfg(target_os = "linux")]
pub const CHUNKS_PER_BUFFER: usize = 32;
#[cfg(not(target_os = "linux"))]
pub const CHUNKS_PER_BUFFER: usize = 1;

/// Size of one chunk region in the buffer's data area.
///
/// In batched mode datagrams larger than this are truncated by the kernel,
/// same as any receive into an undersized iovec.
#[cfg(target_os = "linux")]
pub const CHUNK_DATA_SIZE: usize = 4 * 1024;
#[cfg(not(target_os = "linux"))]
pub const CHUNK_DATA_SIZE: usize = 64 * 1024;

/// Total data area per buffer.
pub const BUFFER_DATA_SIZE: usize = CHUNKS_PER_BUFFER * CHUNK_DATA_SIZE;

/// Index of a buffer within its owning pool.
///
/// Buffers are never deallocated while the pool lives, so ids stay valid for
/// the pool's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

impl BufferId {
    pub(crate) fn new(index: usize) -> Self {
        BufferId(index as u32)
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// A fixed-capacity memory block divided into chunk regions.
///
/// The reference count tracks in-flight sends borrowing chunks from this
/// buffer. It is zero while the buffer sits in the pool and only returns to
/// zero on the buffer's home worker thread; buffers never cross threads.
pub struct Buffer {
    data: Box<[u8]>,
    chunk_size: usize,
    chunk_capacity: usize,
    ref_count: usize,
}

impl Buffer {
    pub(crate) fn new(chunk_capacity: usize, chunk_size: usize) -> Self {
        assert!(chunk_capacity > 0, "buffer needs at least one chunk");
        assert!(chunk_size > 0, "chunk size must be positive");
        Self {
            data: vec![0u8; chunk_capacity * chunk_size].into_boxed_slice(),
            chunk_size,
            chunk_capacity,
            ref_count: 0,
        }
    }

    /// Number of in-flight send chunks borrowed from this buffer.
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Full data area, as handed to the kernel for receives.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Mutable view of one chunk region.
    pub fn chunk_mut(&mut self, index: usize) -> &mut [u8] {
        assert!(index < self.chunk_capacity, "chunk index out of range");
        let start = index * self.chunk_size;
        &mut self.data[start..start + self.chunk_size]
    }

    /// Claim the next send chunk, incrementing the reference count.
    ///
    /// The design assumes send fan-out per receive burst never exceeds the
    /// chunk capacity; exceeding it is a correctness violation, not
    /// backpressure, and takes the fatal path.
    pub(crate) fn claim_chunk(&mut self) -> usize {
        if self.ref_count == self.chunk_capacity {
            panic!(
                "start_send: buffer chunk capacity exhausted ({} in flight)",
                self.chunk_capacity
            );
        }
        let index = self.ref_count;
        self.ref_count += 1;
        index
    }

    /// Complete one send chunk, returning the new reference count.
    pub(crate) fn complete_chunk(&mut self) -> usize {
        assert!(self.ref_count > 0, "send completion without claimed chunk");
        self.ref_count -= 1;
        self.ref_count
    }

    pub(crate) fn reset(&mut self) {
        self.ref_count = 0;
    }
}

/// Non-owning view over a region of a buffer's data area.
///
/// A packet must not be read after its owning buffer returns to the pool;
/// the receive and send paths enforce this through the reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    buf: BufferId,
    offset: u32,
    len: u32,
}

impl Packet {
    pub(crate) fn new(buf: BufferId, offset: usize, len: usize) -> Self {
        Self {
            buf,
            offset: offset as u32,
            len: len as u32,
        }
    }

    /// The buffer this packet aliases.
    #[inline]
    pub fn buffer(&self) -> BufferId {
        self.buf
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_and_complete() {
        let mut buf = Buffer::new(4, 1024);
        assert_eq!(buf.ref_count(), 0);

        assert_eq!(buf.claim_chunk(), 0);
        assert_eq!(buf.claim_chunk(), 1);
        assert_eq!(buf.ref_count(), 2);

        assert_eq!(buf.complete_chunk(), 1);
        assert_eq!(buf.complete_chunk(), 0);
    }

    #[test]
    #[should_panic(expected = "chunk capacity exhausted")]
    fn test_claim_beyond_capacity_is_fatal() {
        let mut buf = Buffer::new(1, 1024);
        buf.claim_chunk();
        buf.claim_chunk();
    }

    #[test]
    #[should_panic(expected = "without claimed chunk")]
    fn test_complete_without_claim_is_fatal() {
        let mut buf = Buffer::new(1, 1024);
        buf.complete_chunk();
    }

    #[test]
    fn test_chunk_regions_are_disjoint() {
        let mut buf = Buffer::new(2, 8);
        buf.chunk_mut(0).copy_from_slice(b"aaaaaaaa");
        buf.chunk_mut(1).copy_from_slice(b"bbbbbbbb");
        assert_eq!(&buf.data()[..8], b"aaaaaaaa");
        assert_eq!(&buf.data()[8..16], b"bbbbbbbb");
    }

    #[test]
    fn test_reset_clears_ref_count() {
        let mut buf = Buffer::new(2, 8);
        buf.claim_chunk();
        buf.reset();
        assert_eq!(buf.ref_count(), 0);
    }
}
