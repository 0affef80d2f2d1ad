//! # Package Loader Interface
//!
//! Packages carry the code and data that get loaded into instances. Their archive
//! format belongs to the loader, not to poolrun; this module only defines how bytes
//! are reached and keeps the package tied to the pool it was opened for, so that code
//! using the package can lease sessions from the same pool.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use crate::pool::Pool;
use crate::session::Session;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// A read went past the end of the package.
    OutOfBounds { pos: u64, len: usize, size: u64 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Package I/O error: {}", e),
            Self::OutOfBounds { pos, len, size } => {
                write!(f, "Read of {} bytes at {} exceeds package size {}", len, pos, size)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Random-access reader over a package's bytes.
pub trait ReadAdapter: Send + Sync {
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `pos`, returning how many were read.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl ReadAdapter for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let start = usize::try_from(pos).unwrap_or(usize::MAX).min(self.len());
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

/// Package bytes backed by a file.
#[derive(Debug)]
pub struct FileAdapter {
    file: File,
    size: u64,
}

impl FileAdapter {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ReadAdapter for FileAdapter {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read_at(buf, pos)
    }
}

/// Where a package comes from.
#[derive(Clone)]
pub enum PackageSource {
    /// A location, currently a filesystem path.
    Uri(String),
    Reader(Arc<dyn ReadAdapter>),
}

impl std::fmt::Debug for PackageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uri(uri) => f.debug_tuple("Uri").field(uri).finish(),
            Self::Reader(reader) => f.debug_struct("Reader").field("size", &reader.size()).finish(),
        }
    }
}

/// A package opened against a pool.
#[derive(Clone)]
pub struct Package {
    source: PackageSource,
    reader: Arc<dyn ReadAdapter>,
    pool: Pool,
}

impl Package {
    pub(crate) fn open(source: PackageSource, pool: Pool) -> Result<Self> {
        let reader: Arc<dyn ReadAdapter> = match &source {
            PackageSource::Uri(uri) => Arc::new(FileAdapter::open(uri)?),
            PackageSource::Reader(reader) => Arc::clone(reader),
        };
        Ok(Self { source, reader, pool })
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Reads exactly `len` bytes at `pos`.
    pub fn read(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let size = self.reader.size();
        if pos.checked_add(len as u64).is_none_or(|end| end > size) {
            return Err(Error::OutOfBounds { pos, len, size });
        }

        let mut buf = vec![0; len];
        let mut filled = 0;
        while filled < len {
            let n = self.reader.read_at(pos + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        Ok(buf)
    }

    /// Leases a session from the package's pool.
    pub fn acquire_session(&self) -> Session {
        self.pool.acquire_one()
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package").field("source", &self.source).finish()
    }
}
