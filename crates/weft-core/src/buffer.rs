use std::sync::Arc;

/// Default capacity of a shared buffer in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;
/// Largest allowed buffer capacity (one datagram's worth of payload).
pub const MAX_BUFFER_CAPACITY: usize = 65536;

/// SharedBuffer is a reference-counted, immutable byte buffer.
///
/// It holds an `Arc<[u8]>`, so clones are cheap and the bytes stay alive for
/// as long as any callback or in-flight send references them. Buffers handed
/// to callbacks are always fresh copies sized to the bytes actually
/// received; the capacity bound only applies at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedBuffer {
    data: Arc<[u8]>,
}

impl SharedBuffer {
    /// Creates a zero-filled buffer of `capacity` bytes.
    ///
    /// Panics if `capacity` is outside `(0, 65536]`.
    pub fn zeroed(capacity: usize) -> Self {
        assert_capacity(capacity);
        Self { data: Arc::from(vec![0u8; capacity].into_boxed_slice()) }
    }

    /// Copies `data` into a fresh buffer, truncated to `capacity` bytes.
    ///
    /// Panics if `capacity` is outside `(0, 65536]`.
    pub fn from_slice(data: &[u8], capacity: usize) -> Self {
        assert_capacity(capacity);
        let len = data.len().min(capacity);
        Self { data: Arc::from(data[..len].to_vec().into_boxed_slice()) }
    }

    /// An empty buffer, used by error events that carry no payload.
    pub fn empty() -> Self {
        Self { data: Arc::from(Vec::new().into_boxed_slice()) }
    }

    /// Creates a buffer from a Vec by taking ownership.
    ///
    /// Panics if the vector is longer than the maximum capacity.
    pub fn from_vec(vec: Vec<u8>) -> Self {
        assert!(vec.len() <= MAX_BUFFER_CAPACITY, "buffer exceeds maximum capacity");
        Self { data: Arc::from(vec.into_boxed_slice()) }
    }

    /// Returns the buffer contents as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the length of the buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if `other` shares the same allocation.
    pub fn shares_allocation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

fn assert_capacity(capacity: usize) {
    assert!(capacity > 0, "buffer capacity must be greater than 0");
    assert!(
        capacity <= MAX_BUFFER_CAPACITY,
        "buffer capacity must be less than or equal to {}",
        MAX_BUFFER_CAPACITY
    );
}

impl From<Vec<u8>> for SharedBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::from_vec(v)
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
