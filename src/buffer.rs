use std::fmt::{Display, Formatter};

/// Allocation failure at pool construction time.
#[derive(Debug)]
pub struct AllocError;

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to allocate batch buffer")
    }
}

impl std::error::Error for AllocError {}

/// A contiguous block of batch storage with an optional per-item offset
/// table.
///
/// Readers fill a buffer incrementally with [`push_item`](Self::push_item),
/// growing the backing storage on demand; decode output buffers are sized
/// exactly and written through raw regions instead. Both uses share the
/// same type, as the block is always fully allocated and zero-initialised
/// up to its current capacity.
pub struct Buffer<T> {
    data: Vec<T>,
    items: Vec<(usize, usize)>,
    used: usize,
    pinned: bool,
}

impl<T: Copy + Default> Buffer<T> {
    /// Allocates a zeroed block of `len` elements. The `pinned` flag
    /// records a page-locked allocation request for device transfer; the
    /// host block itself is staged through the device's copy stream.
    pub fn new(len: usize, pinned: bool) -> Result<Self, AllocError> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| AllocError)?;
        data.resize(len, T::default());

        Ok(Self { data, items: Vec::new(), used: 0, pinned })
    }

    /// Clears the item table and the fill cursor, keeping the allocation.
    pub fn reset(&mut self) {
        self.items.clear();
        self.used = 0;
    }

    /// Appends one variable-length item, growing the block if it does
    /// not fit.
    pub fn push_item(&mut self, item: &[T]) {
        let end = self.used + item.len();
        if end > self.data.len() {
            let grown = end.max(2 * self.data.len());
            self.data.resize(grown, T::default());
        }

        self.data[self.used..end].copy_from_slice(item);
        self.items.push((self.used, item.len()));
        self.used = end;
    }

    /// Looks up item `i` pushed by the producer of this buffer.
    pub fn item(&self, i: usize) -> Option<&[T]> {
        let (offset, len) = *self.items.get(i)?;
        Some(&self.data[offset..offset + len])
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Bulk access to the whole block.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Base pointer for region writes by the decode workers. Regions
    /// handed out from this pointer must not overlap.
    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.data.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// The unit of exchange between pipeline stages: one batch's data,
/// targets and per-item metadata, filled and consumed together.
///
/// `meta` holds `2 * B` integers for batch size `B`: the first `B`
/// entries carry decoder metadata, the second `B` the original encoded
/// target lengths. Pools that do not carry metadata leave it `None`.
pub struct BufferTriple {
    pub data: Buffer<u8>,
    pub targets: Buffer<u8>,
    pub meta: Option<Buffer<i32>>,
}

impl BufferTriple {
    pub fn new(
        data_len: usize,
        target_len: usize,
        meta_len: Option<usize>,
        pinned: bool,
    ) -> Result<Self, AllocError> {
        Ok(Self {
            data: Buffer::new(data_len, pinned)?,
            targets: Buffer::new(target_len, pinned)?,
            meta: meta_len.map(|len| Buffer::new(len, pinned)).transpose()?,
        })
    }

    /// Clears the item tables of both payload buffers.
    pub fn reset(&mut self) {
        self.data.reset();
        self.targets.reset();
    }
}
