// Persistent append engine over a mapped pool. Appends are two-phase: the
// data range is made durable first, then the single write-offset word. A
// crash between the phases leaves the durable offset unchanged, so the
// half-written bytes are never visible to a later open or walk.
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::core::ctl::{Ctl, QueryKind};
use crate::core::desc::{LogDesc, DESC_LEN, DESC_OFF, WRITE_OFF_FIELD};
use crate::core::error::{Error, ErrorKind};
use crate::core::pmem::{self, MutationHook, NoopHook};
use crate::core::pool::{page_size, CreateConfig, OpenConfig, PoolSet, POOL_HDR_SIZE};

/// An open log pool. One reader/writer lock guards the descriptor fields and
/// the data region: append and rewind are writers; capacity, tell, and walk
/// are readers. Dropping the handle releases the lock and the mapping.
pub struct LogPool {
    set: RwLock<PoolSet>,
    hook: Box<dyn MutationHook>,
    ctl: Ctl,
}

impl LogPool {
    /// Create a log pool at `path` spanning `pool_size` bytes and leave it
    /// open read-write. A failed creation deletes whatever it created.
    pub fn create(
        path: impl AsRef<Path>,
        pool_size: u64,
        config: CreateConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!(path = %path.display(), pool_size, "create pool");

        let mut set = PoolSet::create(path, pool_size, config)?;
        if let Err(err) = descr_create(&mut set) {
            set.close(true);
            return Err(err);
        }
        Ok(Self::runtime_init(set, Box::new(NoopHook)))
    }

    /// Open an existing pool read-write with a validated descriptor.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::open_with(path, OpenConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: OpenConfig) -> Result<Self, Error> {
        Self::open_with_hook(path, config, Box::new(NoopHook))
    }

    /// Open with an instrumentation hook observing mutation boundaries.
    /// The hook cannot change what gets persisted.
    pub fn open_with_hook(
        path: impl AsRef<Path>,
        config: OpenConfig,
        hook: Box<dyn MutationHook>,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        debug!(path = %path.display(), ?config, "open pool");

        let set = PoolSet::open(path, config)?;
        let desc = LogDesc::read(set.map());
        desc.validate(set.pool_size())?;
        Ok(Self::runtime_init(set, hook))
    }

    fn runtime_init(set: PoolSet, hook: Box<dyn MutationHook>) -> Self {
        // Best-effort protection requests: the header page should never be
        // touched through this mapping, the rest only via the engine.
        hook.deny(0, POOL_HDR_SIZE);
        hook.protect(POOL_HDR_SIZE, set.mapped_len().saturating_sub(POOL_HDR_SIZE));
        Self {
            set: RwLock::new(set),
            hook,
            ctl: Ctl::new(),
        }
    }

    /// Usable log space in bytes, constant for the pool's lifetime.
    pub fn capacity(&self) -> u64 {
        let set = self.read_set();
        let desc = LogDesc::read(set.map());
        desc.end_offset - desc.start_offset
    }

    /// Number of valid bytes currently in the log.
    pub fn tell(&self) -> u64 {
        let set = self.read_set();
        let desc = LogDesc::read(set.map());
        desc.write_offset - desc.start_offset
    }

    /// Append `buf` to the log. All-or-nothing: on any error (and across any
    /// crash) the log is left exactly as it was.
    pub fn append(&self, buf: &[u8]) -> Result<(), Error> {
        trace!(len = buf.len(), "append");

        let mut set = self.write_set();
        if set.read_only() {
            return Err(read_only("append"));
        }

        let desc = LogDesc::read(set.map());
        check_space(&desc, buf.len() as u64)?;

        let offset = desc.write_offset as usize;
        let is_pmem = set.is_pmem();
        self.hook.unprotect(offset, buf.len());
        pmem::copy_nodrain(&mut set.map_mut()[offset..offset + buf.len()], buf, is_pmem);
        self.hook.protect(offset, buf.len());

        self.persist_tail(&mut set, desc.write_offset, desc.write_offset + buf.len() as u64)
    }

    /// Append the segments in order as one atomic record of their combined
    /// length. The total is computed before any copy; a request that does
    /// not fit is rejected with nothing written.
    pub fn append_vectored(&self, segments: &[&[u8]]) -> Result<(), Error> {
        trace!(segments = segments.len(), "append_vectored");

        let mut set = self.write_set();
        if set.read_only() {
            return Err(read_only("append"));
        }

        let desc = LogDesc::read(set.map());
        let mut total: u64 = 0;
        for segment in segments {
            total = total.checked_add(segment.len() as u64).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message("combined segment length overflows the offset space")
            })?;
        }
        check_space(&desc, total)?;

        let is_pmem = set.is_pmem();
        let mut write_offset = desc.write_offset;
        for segment in segments {
            let offset = write_offset as usize;
            self.hook.unprotect(offset, segment.len());
            pmem::copy_nodrain(
                &mut set.map_mut()[offset..offset + segment.len()],
                segment,
                is_pmem,
            );
            self.hook.protect(offset, segment.len());
            write_offset += segment.len() as u64;
        }

        self.persist_tail(&mut set, desc.write_offset, write_offset)
    }

    /// Discard all data, resetting the log to empty. The reset is a single
    /// word-sized persist and therefore crash-atomic on its own.
    pub fn rewind(&self) -> Result<(), Error> {
        debug!("rewind");

        let mut set = self.write_set();
        if set.read_only() {
            return Err(read_only("rewind"));
        }

        let desc = LogDesc::read(set.map());
        self.hook.unprotect(DESC_OFF, DESC_LEN);
        store_write_offset(&mut set, desc.start_offset);
        let result = pmem::persist(set.map(), WRITE_OFF_FIELD, 8, set.is_pmem());
        self.hook.protect(DESC_OFF, DESC_LEN);
        result
    }

    /// Walk the valid range in order. `chunk_size == 0` delivers everything
    /// in a single visit; otherwise each visit sees up to `chunk_size` bytes
    /// and returning `false` stops the walk. The read lock is held for the
    /// whole traversal, so the data cannot move underneath the visitor.
    pub fn walk<F>(&self, chunk_size: u64, mut visit: F)
    where
        F: FnMut(&[u8]) -> bool,
    {
        trace!(chunk_size, "walk");

        let set = self.read_set();
        let desc = LogDesc::read(set.map());
        let data = set.map();
        let start = desc.start_offset as usize;
        let write = desc.write_offset as usize;

        if chunk_size == 0 {
            visit(&data[start..write]);
            return;
        }

        let chunk = chunk_size as usize;
        let mut offset = start;
        while offset < write {
            let len = chunk.min(write - offset);
            if !visit(&data[offset..offset + len]) {
                break;
            }
            offset += len;
        }
    }

    /// Pool-scoped control queries; registration happens via [`Self::ctl`].
    pub fn query_get(&self, name: &str, arg: &mut dyn std::any::Any) -> Result<(), Error> {
        self.ctl.query(QueryKind::Read, name, arg)
    }

    pub fn query_set(&self, name: &str, arg: &mut dyn std::any::Any) -> Result<(), Error> {
        self.ctl.query(QueryKind::Write, name, arg)
    }

    pub fn query_exec(&self, name: &str, arg: &mut dyn std::any::Any) -> Result<(), Error> {
        self.ctl.query(QueryKind::Exec, name, arg)
    }

    pub fn ctl(&self) -> &Ctl {
        &self.ctl
    }

    /// Data first, then the descriptor: the write offset only ever advances
    /// over bytes that are already durable.
    fn persist_tail(&self, set: &mut PoolSet, old: u64, new: u64) -> Result<(), Error> {
        let is_pmem = set.is_pmem();
        pmem::persist(set.map(), old as usize, (new - old) as usize, is_pmem)?;

        self.hook.unprotect(DESC_OFF, DESC_LEN);
        store_write_offset(set, new);
        let result = pmem::persist(set.map(), WRITE_OFF_FIELD, 8, is_pmem);
        self.hook.protect(DESC_OFF, DESC_LEN);
        result
    }

    // A panicking writer can only have copied data past the durable write
    // offset; the descriptor itself is never left mid-update. Re-entering a
    // poisoned lock is therefore safe.
    fn read_set(&self) -> RwLockReadGuard<'_, PoolSet> {
        self.set.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_set(&self) -> RwLockWriteGuard<'_, PoolSet> {
        self.set.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn descr_create(set: &mut PoolSet) -> Result<(), Error> {
    debug_assert_eq!(set.pool_size() % page_size() as u64, 0);

    let desc = LogDesc::new(set.pool_size());
    set.map_mut()[DESC_OFF..DESC_OFF + DESC_LEN].copy_from_slice(&desc.encode());
    // store the non-volatile part of the descriptor; the set header was
    // already persisted by the pool-set layer
    pmem::persist(set.map(), DESC_OFF, DESC_LEN, set.is_pmem())
}

fn store_write_offset(set: &mut PoolSet, value: u64) {
    set.map_mut()[WRITE_OFF_FIELD..WRITE_OFF_FIELD + 8].copy_from_slice(&value.to_le_bytes());
}

fn check_space(desc: &LogDesc, requested: u64) -> Result<(), Error> {
    if desc.write_offset >= desc.end_offset {
        return Err(Error::new(ErrorKind::NoSpace)
            .with_message("log is full")
            .with_offset(desc.write_offset));
    }
    if requested > desc.end_offset - desc.write_offset {
        return Err(Error::new(ErrorKind::NoSpace)
            .with_message(format!(
                "append of {requested} bytes exceeds remaining capacity {}",
                desc.end_offset - desc.write_offset
            ))
            .with_offset(desc.write_offset));
    }
    Ok(())
}

fn read_only(op: &str) -> Error {
    Error::new(ErrorKind::ReadOnly).with_message(format!("cannot {op} on a read-only pool"))
}
