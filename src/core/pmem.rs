// Durability primitives consumed by the append engine, plus the pluggable
// instrumentation hook fired around mutation boundaries.
use memmap2::MmapMut;

use crate::core::error::{Error, ErrorKind};

/// Copy bytes into the pool without making them durable. On real persistent
/// memory the original issues non-caching stores here and settles them in
/// `drain`; stable Rust has no such primitive, so both media take the plain
/// copy and defer durability to `persist`.
pub(crate) fn copy_nodrain(dst: &mut [u8], src: &[u8], _is_pmem: bool) {
    dst.copy_from_slice(src);
}

/// Make a byte range durable. Direct persistent memory settles its deferred
/// stores; a mapped file syncs the touched range.
pub(crate) fn persist(map: &MmapMut, offset: usize, len: usize, is_pmem: bool) -> Result<(), Error> {
    if is_pmem {
        drain(map, offset, len)
    } else {
        sync_range(map, offset, len)
    }
}

/// Wait until stores issued for the range have reached durable media. With
/// no cache-flush intrinsics available this lowers to the same range sync,
/// still issued once per append rather than once per segment.
pub(crate) fn drain(map: &MmapMut, offset: usize, len: usize) -> Result<(), Error> {
    sync_range(map, offset, len)
}

fn sync_range(map: &MmapMut, offset: usize, len: usize) -> Result<(), Error> {
    map.flush_range(offset, len).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("range sync failed")
            .with_offset(offset as u64)
            .with_source(err)
    })
}

/// Observation points around every pool mutation. The default hook does
/// nothing; debug builds can plug in page-protection toggling or fault
/// injection. Hooks must never affect what gets persisted.
pub trait MutationHook: Send + Sync {
    /// A range is about to be written.
    fn unprotect(&self, _offset: usize, _len: usize) {}
    /// Writing of a range finished.
    fn protect(&self, _offset: usize, _len: usize) {}
    /// A range should never be touched through this mapping (header page).
    fn deny(&self, _offset: usize, _len: usize) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHook;

impl MutationHook for NoopHook {}
