//! Request validation and lowering.
//!
//! Validation happens synchronously at issuance so that a rejected request
//! never creates asynchronous work. Lowering turns a caller [`Request`] into
//! the [`StoreOp`] a backing store understands: write-same becomes a plain
//! write over an engine-owned pattern buffer, and discard becomes
//! write-zeroes.

use rbdshim_core::request::total_len;
use rbdshim_core::{IoSegment, OpKind, RbdError, Request, Result, StoreOp};

/// Upper bound on the expanded write-same pattern buffer. Longer ranges
/// reuse the same buffer across several segments.
const PATTERN_LIMIT: usize = 1 << 20;

/// A request ready for a backing store.
pub struct Lowered {
    pub op: StoreOp,
    /// Bytes reported to the caller on success (0 for flush).
    pub reported: i64,
    /// Engine-owned memory the op's segments point into; must outlive it.
    pub pattern: Option<Vec<u8>>,
}

impl std::fmt::Debug for Lowered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lowered")
            .field("op", &self.op.kind())
            .field("reported", &self.reported)
            .field("pattern", &self.pattern.as_ref().map(Vec::len))
            .finish()
    }
}

/// Reject anything the image cannot accept.
pub fn validate(req: &Request, image_size: u64, read_only: bool) -> Result<()> {
    if read_only && req.kind.is_mutation() {
        return Err(RbdError::ReadOnly);
    }
    if req.kind == OpKind::Flush {
        return Ok(());
    }

    let end = req
        .offset
        .checked_add(req.len)
        .ok_or(RbdError::InvalidArgument("offset + length overflows"))?;
    if end > image_size {
        return Err(RbdError::InvalidArgument("range beyond end of image"));
    }

    match req.kind {
        OpKind::Read | OpKind::Write => {
            if req.len > 0 && req.segments.is_empty() {
                return Err(RbdError::InvalidArgument("no buffer for non-empty request"));
            }
            if req.segments.iter().any(IoSegment::is_dangling) {
                return Err(RbdError::InvalidArgument("null buffer segment"));
            }
            if total_len(&req.segments) != Some(req.len) {
                return Err(RbdError::InvalidArgument("segment lengths do not match request"));
            }
        }
        OpKind::WriteSame => {
            let stamp = req.stamp.ok_or(RbdError::InvalidArgument("write-same without stamp"))?;
            if stamp.len == 0 {
                return Err(RbdError::InvalidArgument("empty write-same stamp"));
            }
            if stamp.ptr.is_null() {
                return Err(RbdError::InvalidArgument("null write-same stamp"));
            }
            if req.len % stamp.len as u64 != 0 {
                return Err(RbdError::InvalidArgument("stamp does not divide length"));
            }
        }
        OpKind::WriteZeroes | OpKind::Discard | OpKind::Flush => {}
    }
    Ok(())
}

/// Lower a validated request.
///
/// # Safety
/// For write-same, the stamp must be readable for its full length; it is
/// copied here and not referenced afterwards.
pub unsafe fn lower(req: Request) -> Lowered {
    let reported = if req.kind == OpKind::Flush { 0 } else { req.len.min(i64::MAX as u64) as i64 };
    match req.kind {
        OpKind::Read => Lowered {
            op: StoreOp::Read { offset: req.offset, segments: req.segments },
            reported,
            pattern: None,
        },
        OpKind::Write => Lowered {
            op: StoreOp::Write { offset: req.offset, segments: req.segments },
            reported,
            pattern: None,
        },
        OpKind::WriteZeroes | OpKind::Discard => Lowered {
            op: StoreOp::WriteZeroes { offset: req.offset, len: req.len },
            reported,
            pattern: None,
        },
        OpKind::Flush => Lowered { op: StoreOp::Flush, reported, pattern: None },
        OpKind::WriteSame => {
            let stamp = match req.stamp {
                Some(s) => s.as_slice(),
                None => &[],
            };
            let (pattern, segments) = expand_pattern(stamp, req.len);
            Lowered {
                op: StoreOp::Write { offset: req.offset, segments },
                reported,
                pattern: Some(pattern),
            }
        }
    }
}

/// Repeat `stamp` into a bounded buffer and cover `len` bytes with segments
/// over it. `stamp.len()` must divide `len`.
fn expand_pattern(stamp: &[u8], len: u64) -> (Vec<u8>, Vec<IoSegment>) {
    if stamp.is_empty() || len == 0 {
        return (Vec::new(), Vec::new());
    }
    let repeats = (PATTERN_LIMIT / stamp.len()).max(1) as u64;
    let chunk = (repeats * stamp.len() as u64).min(len) as usize;
    let pattern: Vec<u8> = stamp.iter().copied().cycle().take(chunk).collect();

    // The Vec's heap buffer does not move when the Vec itself is moved.
    let base = pattern.as_ptr() as *mut u8;
    let mut segments = Vec::with_capacity((len / chunk as u64 + 1) as usize);
    let mut left = len;
    while left > 0 {
        let n = (chunk as u64).min(left) as usize;
        segments.push(IoSegment::new(base, n));
        left -= n as u64;
    }
    (pattern, segments)
}
