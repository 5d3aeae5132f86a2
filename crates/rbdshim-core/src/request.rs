//! Request descriptor types.
//!
//! These mirror the arguments of the `rbd_aio_*` C calls but are plain
//! Rust types. They are the *lingua franca* between the dispatch layer
//! and the backing stores.

/// One caller buffer segment (`struct iovec` equivalent).
///
/// The engine never owns this memory. For asynchronous requests the caller
/// keeps it valid (and, for reads, unaliased) until the completion is ready.
#[derive(Debug, Clone, Copy)]
pub struct IoSegment {
    /// Start of the buffer (caller address).
    pub ptr: *mut u8,
    /// Length in bytes.
    pub len: usize,
}

// Safety: segments are just pointers + lengths; the request contract
// guarantees the memory outlives the operation that carries them.
unsafe impl Send for IoSegment {}
unsafe impl Sync for IoSegment {}

impl IoSegment {
    #[inline]
    pub const fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Segment over a source buffer (write side).
    #[inline]
    pub fn from_slice(buf: &[u8]) -> Self {
        Self { ptr: buf.as_ptr() as *mut u8, len: buf.len() }
    }

    /// Segment over a destination buffer (read side).
    #[inline]
    pub fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self { ptr: buf.as_mut_ptr(), len: buf.len() }
    }

    /// A null pointer paired with a non-zero length.
    #[inline]
    pub fn is_dangling(&self) -> bool {
        self.ptr.is_null() && self.len > 0
    }

    /// # Safety
    /// `ptr` must be valid for reads of `len` bytes for `'a`.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// # Safety
    /// `ptr` must be valid for writes of `len` bytes for `'a` and not
    /// aliased by any other live reference.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Sum of segment lengths, `None` on overflow.
pub fn total_len(segments: &[IoSegment]) -> Option<u64> {
    segments
        .iter()
        .try_fold(0u64, |acc, s| acc.checked_add(s.len as u64))
}

/// Kind of operation carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Read = 0,
    Write = 1,
    /// Stamp repeated to fill the range.
    WriteSame = 2,
    WriteZeroes = 3,
    /// Same observable effect as WriteZeroes.
    Discard = 4,
    Flush = 5,
}

impl OpKind {
    /// Whether this operation changes image contents.
    #[inline]
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, OpKind::Read | OpKind::Flush)
    }

    /// Whether this operation must be ordered before a later flush.
    #[inline]
    pub const fn is_ordered_by_flush(&self) -> bool {
        self.is_mutation()
    }

    pub const fn name(&self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::WriteSame => "writesame",
            OpKind::WriteZeroes => "write_zeroes",
            OpKind::Discard => "discard",
            OpKind::Flush => "flush",
        }
    }
}

/// An I/O request as issued by the caller.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: OpKind,
    /// Byte offset into the image.
    pub offset: u64,
    /// Bytes covered on the image (the output length for write-same).
    pub len: u64,
    /// Data segments (read destination, write source). Empty for
    /// write-same, write-zeroes, discard and flush.
    pub segments: Vec<IoSegment>,
    /// Write-same pattern.
    pub stamp: Option<IoSegment>,
}

impl Request {
    fn with_segments(kind: OpKind, offset: u64, segments: Vec<IoSegment>) -> Self {
        // Overflow is reported by validation; saturate here.
        let len = total_len(&segments).unwrap_or(u64::MAX);
        Self { kind, offset, len, segments, stamp: None }
    }

    pub fn read(offset: u64, segments: Vec<IoSegment>) -> Self {
        Self::with_segments(OpKind::Read, offset, segments)
    }

    pub fn write(offset: u64, segments: Vec<IoSegment>) -> Self {
        Self::with_segments(OpKind::Write, offset, segments)
    }

    pub fn write_same(offset: u64, len: u64, stamp: IoSegment) -> Self {
        Self { kind: OpKind::WriteSame, offset, len, segments: Vec::new(), stamp: Some(stamp) }
    }

    pub fn write_zeroes(offset: u64, len: u64) -> Self {
        Self { kind: OpKind::WriteZeroes, offset, len, segments: Vec::new(), stamp: None }
    }

    pub fn discard(offset: u64, len: u64) -> Self {
        Self { kind: OpKind::Discard, offset, len, segments: Vec::new(), stamp: None }
    }

    pub fn flush() -> Self {
        Self { kind: OpKind::Flush, offset: 0, len: 0, segments: Vec::new(), stamp: None }
    }
}
