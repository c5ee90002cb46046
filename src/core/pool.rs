// Pool-set lifecycle: exclusive file creation with rollback, set-header
// validation, shared/copy-on-write mappings, and advisory locking.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, ENOMEM, EPERM};
use memmap2::{MmapMut, MmapOptions};

use crate::core::error::{Error, ErrorKind};

const MAGIC: [u8; 4] = *b"PALG";
const VERSION: u32 = 1;
const ENDIANNESS_LE: u8 = 1;

/// Size reserved for the generic set header at the front of every pool.
pub const POOL_HDR_SIZE: usize = 4096;

/// Smallest accepted pool, matching the log format's alignment comfortably.
pub const MIN_POOL: u64 = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SetHeader {
    pub pool_size: u64,
    pub replicas: u32,
}

impl SetHeader {
    fn new(pool_size: u64) -> Self {
        Self {
            pool_size,
            replicas: 1,
        }
    }

    fn encode(&self) -> [u8; POOL_HDR_SIZE] {
        let mut buf = [0u8; POOL_HDR_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8] = ENDIANNESS_LE;
        buf[16..24].copy_from_slice(&self.pool_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.replicas.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < POOL_HDR_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("set header too small"));
        }
        if buf[0..4] != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("bad magic"));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported version"));
        }
        if buf[8] != ENDIANNESS_LE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported endianness"));
        }

        let pool_size = u64::from_le_bytes(read_8(buf, 16));
        let replicas = u32::from_le_bytes(read_4(buf, 24));

        Ok(Self {
            pool_size,
            replicas,
        })
    }

    fn validate(&self, actual_size: u64) -> Result<(), Error> {
        if self.pool_size == 0 || self.pool_size > actual_size {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid pool size"));
        }
        if self.pool_size < MIN_POOL {
            return Err(Error::new(ErrorKind::Corrupt).with_message("pool below minimum size"));
        }
        Ok(())
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

#[derive(Clone, Copy, Debug)]
pub struct CreateConfig {
    /// Unix permission bits applied to the created pool file.
    pub mode: u32,
}

impl Default for CreateConfig {
    fn default() -> Self {
        Self { mode: 0o644 }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenConfig {
    /// Reject every mutating operation on the resulting handle.
    pub read_only: bool,
    /// Map privately so writes never reach the underlying storage. Used by
    /// the consistency checker to inspect a pool another handle has open.
    pub copy_on_write: bool,
}

impl OpenConfig {
    fn is_read_write(&self) -> bool {
        !self.read_only && !self.copy_on_write
    }
}

/// A single mapped pool region plus the facts the engine needs about it.
/// The mapping lives exactly as long as this handle.
#[derive(Debug)]
pub struct PoolSet {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    pool_size: u64,
    read_only: bool,
    is_pmem: bool,
    is_dev_dax: bool,
    locked: bool,
}

impl PoolSet {
    pub fn create(
        path: impl AsRef<Path>,
        requested_size: u64,
        config: CreateConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(&path).with_source(err))?;

        // Anything created during a failed attempt is deleted again.
        match Self::create_parts(&path, file, requested_size, config) {
            Ok(set) => Ok(set),
            Err(err) => {
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    fn create_parts(
        path: &Path,
        mut file: File,
        requested_size: u64,
        config: CreateConfig,
    ) -> Result<Self, Error> {
        let is_dev_dax = is_char_device(&file);

        let pool_size = requested_size & !(page_size() as u64 - 1);
        if pool_size < MIN_POOL {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "pool size {requested_size} below minimum {MIN_POOL}"
                ))
                .with_path(path)
                .with_hint("Sizes are rounded down to the page size; ask for at least 2 MiB."));
        }

        if !is_dev_dax {
            file.set_len(pool_size)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        }

        let header = SetHeader::new(pool_size);
        write_header(&mut file, &header, path)?;
        apply_mode(&file, config.mode, path)?;

        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(path)
                .with_source(err)
        })?;

        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|err| Error::new(map_error_kind(&err)).with_path(path).with_source(err))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mmap,
            pool_size,
            read_only: false,
            is_pmem: is_dev_dax,
            is_dev_dax,
            locked: true,
        })
    }

    pub fn open(path: impl AsRef<Path>, config: OpenConfig) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let read_write = config.is_read_write();
        let mut file = OpenOptions::new()
            .read(true)
            .write(read_write)
            .open(&path)
            .map_err(|err| Error::new(open_error_kind(&err)).with_path(&path).with_source(err))?;

        let actual_size = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;

        let header = read_header(&mut file, &path)?;
        header.validate(actual_size)?;
        if header.replicas > 1 {
            return Err(Error::new(ErrorKind::Unsupported)
                .with_message(format!(
                    "pool configured with {} replicas; replicated sets are not supported",
                    header.replicas
                ))
                .with_path(&path));
        }

        // Only read-write opens take the lock: a second writer fails Busy,
        // while checker and read-only views can coexist with one.
        if read_write {
            file.try_lock_exclusive().map_err(|err| {
                Error::new(lock_error_kind(&err))
                    .with_path(&path)
                    .with_hint("Another handle has this pool open read-write.")
                    .with_source(err)
            })?;
        }

        let mmap = unsafe {
            let mapped = if read_write {
                MmapMut::map_mut(&file)
            } else {
                MmapOptions::new().map_copy(&file)
            };
            mapped
                .map_err(|err| Error::new(map_error_kind(&err)).with_path(&path).with_source(err))?
        };

        let is_dev_dax = is_char_device(&file);

        Ok(Self {
            path,
            file,
            mmap,
            pool_size: header.pool_size,
            read_only: config.read_only,
            is_pmem: is_dev_dax,
            is_dev_dax,
            locked: read_write,
        })
    }

    /// Hand the region back, optionally deleting the backing parts. Used by
    /// the create path to roll a failed creation back to the pre-call state.
    pub fn close(self, delete_parts: bool) {
        let path = self.path.clone();
        drop(self);
        if delete_parts {
            let _ = fs::remove_file(path);
        }
    }

    pub fn map(&self) -> &MmapMut {
        &self.mmap
    }

    pub fn map_mut(&mut self) -> &mut MmapMut {
        &mut self.mmap
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool_size(&self) -> u64 {
        self.pool_size
    }

    pub fn mapped_len(&self) -> usize {
        self.mmap.len()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_pmem(&self) -> bool {
        self.is_pmem
    }

    pub fn is_dev_dax(&self) -> bool {
        self.is_dev_dax
    }
}

impl Drop for PoolSet {
    fn drop(&mut self) {
        if self.locked {
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}

pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(unix)]
fn is_char_device(file: &File) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file.metadata()
        .map(|meta| meta.file_type().is_char_device())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_char_device(_file: &File) -> bool {
    false
}

#[cfg(unix)]
fn apply_mode(file: &File, mode: u32, path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))
}

#[cfg(not(unix))]
fn apply_mode(_file: &File, _mode: u32, _path: &Path) -> Result<(), Error> {
    Ok(())
}

fn open_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

fn map_error_kind(err: &io::Error) -> ErrorKind {
    if err.raw_os_error().unwrap_or_default() == ENOMEM {
        return ErrorKind::Resource;
    }
    ErrorKind::Io
}

fn read_header(file: &mut File, path: &Path) -> Result<SetHeader, Error> {
    let mut buf = [0u8; POOL_HDR_SIZE];
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.read_exact(&mut buf)
        .map_err(|err| Error::new(header_read_error_kind(&err)).with_path(path).with_source(err))?;
    SetHeader::decode(&buf)
}

fn header_read_error_kind(err: &io::Error) -> ErrorKind {
    // A file too short to hold the header is malformed, not an I/O fault.
    match err.kind() {
        io::ErrorKind::UnexpectedEof => ErrorKind::Corrupt,
        _ => ErrorKind::Io,
    }
}

fn write_header(file: &mut File, header: &SetHeader, path: &Path) -> Result<(), Error> {
    let buf = header.encode();
    file.seek(SeekFrom::Start(0))
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.write_all(&buf)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    file.sync_data()
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    Ok(())
}
