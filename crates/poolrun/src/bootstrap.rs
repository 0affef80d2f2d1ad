//! # Instance Bootstrapper
//!
//! Materializes one isolated interpreter from a self-contained shared-library image.
//!
//! An image is located through a priority-ordered search path, copied into a private
//! temporary file and `dlopen`ed from there. Every instance gets its own copy, so the
//! dynamic loader never hands two instances the same library and each one owns a
//! private copy of the runtime's global state. The temporary file is unlinked as soon
//! as the library is mapped.
//!
//! ## Image entry points
//!
//! - `poolrun_new_interpreter() -> *mut c_void`: the factory, see [`export_interpreter!`].
//! - `poolrun_set_self(handle: *mut c_void)`: custom-loader images only, called with the
//!   image's own `dlopen` handle before anything else so its extension modules bind
//!   to the private copy of the runtime.
//! - `poolrun_flush_libs()`: custom-loader images only, called at teardown after the
//!   interpreter is gone and before the library is closed.
//!
//! Embedded images are byte ranges linked into the host (e.g. `ld -r -b binary`),
//! found through their start/end symbols. The host must export them dynamically.
//!
//! [`export_interpreter!`]: crate::export_interpreter

use std::borrow::Cow;
use std::ffi::c_int;
use std::ffi::c_void;
use std::io::Write;
use std::mem::ManuallyDrop;
use std::path::PathBuf;
use std::sync::Arc;

use libloading::os::unix::Library;
use libloading::os::unix::RTLD_LAZY;
use libloading::os::unix::RTLD_LOCAL;
use tracing::debug;
use tracing::warn;

use crate::interpreter::Interpreter;

pub const NEW_INTERPRETER_SYMBOL: &str = "poolrun_new_interpreter";
pub const SET_SELF_SYMBOL: &str = "poolrun_set_self";
pub const FLUSH_LIBS_SYMBOL: &str = "poolrun_flush_libs";

type NewInterpreterFn = unsafe extern "C" fn() -> *mut c_void;
type SetSelfFn = unsafe extern "C" fn(*mut c_void);
type FlushLibsFn = unsafe extern "C" fn();

#[derive(Debug)]
pub enum Error {
    /// None of the search path candidates could be found.
    NoImage { searched: Vec<String> },
    Io(std::io::Error),
    Load { dependency: String, source: libloading::Error },
    MissingEntryPoint { name: &'static str, source: libloading::Error },
    NullHandle { dependency: String },
    CustomLoaderUnsupported { dependency: String },
    Factory(anyhow::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoImage { searched } => write!(
                f,
                "no interpreter image found: link a build-time dependency on one of [{}]",
                searched.join(", ")
            ),
            Self::Io(e) => write!(f, "Image I/O error: {}", e),
            Self::Load { dependency, source } => {
                write!(f, "Failed to load image '{}': {}", dependency, source)
            }
            Self::MissingEntryPoint { name, source } => {
                write!(f, "Image entry point '{}' not found: {}", name, source)
            }
            Self::NullHandle { dependency } => {
                write!(f, "Image '{}' returned a null interpreter", dependency)
            }
            Self::CustomLoaderUnsupported { dependency } => write!(
                f,
                "Image '{}' needs custom symbol resolution, which this platform lacks",
                dependency
            ),
            Self::Factory(e) => write!(f, "Interpreter factory failed: {:#}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Load { source, .. } => Some(source),
            Self::MissingEntryPoint { source, .. } => Some(source),
            Self::Factory(e) => Some(&**e),
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

/// Where an image's bytes live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageLocation {
    /// A byte range linked into the host, delimited by two exported symbols.
    Embedded { start: String, end: String },
    /// A prebuilt image on disk. It is still copied per instance.
    File(PathBuf),
}

/// One entry in the image search path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageCandidate {
    /// The build-time dependency that provides this image, for diagnostics.
    pub dependency: String,
    pub location: ImageLocation,
    /// Load with `RTLD_DEEPBIND` and register the handle through `poolrun_set_self`.
    pub custom_loader: bool,
}

impl ImageCandidate {
    /// Candidate for an image embedded as `_binary_<stem>_start` / `_binary_<stem>_end`.
    pub fn embedded(dependency: impl Into<String>, stem: &str, custom_loader: bool) -> Self {
        Self {
            dependency: dependency.into(),
            location: ImageLocation::Embedded {
                start: format!("_binary_{}_start", stem),
                end: format!("_binary_{}_end", stem),
            },
            custom_loader,
        }
    }

    pub fn file(path: impl Into<PathBuf>, custom_loader: bool) -> Self {
        let path = path.into();
        Self {
            dependency: path.display().to_string(),
            location: ImageLocation::File(path),
            custom_loader,
        }
    }

    /// Reads the image bytes, or `None` when this candidate is absent.
    fn read(&self) -> Result<Option<Cow<'static, [u8]>>> {
        match &self.location {
            ImageLocation::Embedded { start, end } => Ok(embedded_bytes(start, end).map(Cow::Borrowed)),
            ImageLocation::File(path) => match std::fs::read(path) {
                Ok(bytes) => Ok(Some(Cow::Owned(bytes))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::Io(e)),
            },
        }
    }
}

fn embedded_bytes(start: &str, end: &str) -> Option<&'static [u8]> {
    let this = Library::this();
    // Safety: the symbols are byte markers, we only take their addresses.
    let start = unsafe { this.get::<*const u8>(start.as_bytes()) }.ok()?.into_raw() as *const u8;
    let end = unsafe { this.get::<*const u8>(end.as_bytes()) }.ok()?.into_raw() as *const u8;
    if end < start {
        return None;
    }
    // Safety: both markers delimit one object linked into the host image, which stays
    // mapped for the life of the process.
    unsafe {
        let len = end.offset_from(start) as usize;
        Some(std::slice::from_raw_parts(start, len))
    }
}

/// The search path used by [`Launcher::embedded`]: the all-in-one image with its own
/// symbol resolution, then the GPU image, then the CPU-only fallback.
pub fn default_search_path() -> Vec<ImageCandidate> {
    vec![
        ImageCandidate::embedded("embedded_interpreter_all", "libpoolrun_interpreter_all_so", true),
        ImageCandidate::embedded("embedded_interpreter_gpu", "libpoolrun_interpreter_gpu_so", false),
        ImageCandidate::embedded("embedded_interpreter_cpu", "libpoolrun_interpreter_cpu_so", false),
    ]
}

/// A dynamically loaded interpreter image.
///
/// Dropping it runs the flush entry point (custom loader only) and closes the library.
/// It must outlive every interpreter it produced; [`Bootstrapped`] enforces that.
pub struct LoadedImage {
    library: ManuallyDrop<Library>,
    dependency: String,
    custom_loader: bool,
}

impl LoadedImage {
    fn load(candidate: &ImageCandidate, bytes: &[u8]) -> Result<Self> {
        let mut flags: c_int = RTLD_LOCAL | RTLD_LAZY;
        if candidate.custom_loader {
            flags |= deepbind_flag(&candidate.dependency)?;
        }

        let mut file = tempfile::Builder::new()
            .prefix("poolrun-")
            .suffix(".so")
            .tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;

        // Safety: loading runs the image's initializers. The image is trusted build output.
        let library = unsafe { Library::open(Some(file.path()), flags) }.map_err(|source| Error::Load {
            dependency: candidate.dependency.clone(),
            source,
        })?;
        debug!(dependency = %candidate.dependency, path = %file.path().display(), custom_loader = candidate.custom_loader, "loaded interpreter image");

        // The mapping keeps the contents alive, the name is no longer needed.
        if let Err(e) = file.close() {
            warn!(error = %e, "failed to unlink interpreter image copy");
        }

        // Register the image's own handle before anything else runs inside it.
        let handle = library.into_raw();
        // Safety: `handle` came from `into_raw` just above and is owned again here.
        let library = unsafe { Library::from_raw(handle) };
        if candidate.custom_loader {
            // Safety: the symbol type matches the documented entry point signature.
            let set_self = unsafe { library.get::<SetSelfFn>(SET_SELF_SYMBOL.as_bytes()) }
                .map_err(|source| Error::MissingEntryPoint { name: SET_SELF_SYMBOL, source })?;
            unsafe { set_self(handle) };
        }

        Ok(Self {
            library: ManuallyDrop::new(library),
            dependency: candidate.dependency.clone(),
            custom_loader: candidate.custom_loader,
        })
    }

    fn new_interpreter(&self) -> Result<Box<dyn Interpreter>> {
        // Safety: the symbol type matches the documented entry point signature.
        let factory = unsafe { self.library.get::<NewInterpreterFn>(NEW_INTERPRETER_SYMBOL.as_bytes()) }
            .map_err(|source| Error::MissingEntryPoint { name: NEW_INTERPRETER_SYMBOL, source })?;

        let raw = unsafe { factory() };
        if raw.is_null() {
            return Err(Error::NullHandle { dependency: self.dependency.clone() });
        }
        // Safety: `export_interpreter!` produced this pointer from a `Box<Box<dyn Interpreter>>`.
        let boxed = unsafe { Box::from_raw(raw as *mut Box<dyn Interpreter>) };
        Ok(*boxed)
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn custom_loader(&self) -> bool {
        self.custom_loader
    }
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        if self.custom_loader {
            // Safety: the symbol type matches the documented entry point signature.
            match unsafe { self.library.get::<FlushLibsFn>(FLUSH_LIBS_SYMBOL.as_bytes()) } {
                Ok(flush) => unsafe { flush() },
                Err(e) => warn!(dependency = %self.dependency, error = %e, "image has no flush entry point"),
            }
        }

        // Safety: the library is taken exactly once, here.
        let library = unsafe { ManuallyDrop::take(&mut self.library) };
        match library.close() {
            Ok(()) => debug!(dependency = %self.dependency, "unloaded interpreter image"),
            Err(e) => warn!(dependency = %self.dependency, error = %e, "failed to unload interpreter image"),
        }
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn deepbind_flag(_dependency: &str) -> Result<c_int> {
    Ok(libc::RTLD_DEEPBIND)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn deepbind_flag(dependency: &str) -> Result<c_int> {
    Err(Error::CustomLoaderUnsupported { dependency: dependency.to_string() })
}

/// Constructs interpreters for a runtime linked directly into the host.
pub type Factory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Interpreter>> + Send + Sync>;

/// How instances come into existence.
#[derive(Clone)]
pub enum Launcher {
    /// Load a private copy of the first image found on the search path.
    Embedded(Vec<ImageCandidate>),
    /// Call a constructor in the host process. Instances share the host's symbols,
    /// so the runtime itself must keep instances apart.
    InProcess(Factory),
}

impl Launcher {
    pub fn embedded() -> Self {
        Self::Embedded(default_search_path())
    }

    pub fn in_process<F>(factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Box<dyn Interpreter>> + Send + Sync + 'static,
    {
        Self::InProcess(Arc::new(factory))
    }

    /// Brings up one interpreter.
    pub fn launch(&self) -> Result<Bootstrapped> {
        match self {
            Self::Embedded(candidates) => {
                let (candidate, bytes) = locate(candidates)?;
                let image = LoadedImage::load(candidate, &bytes)?;
                let interp = image.new_interpreter()?;
                Ok(Bootstrapped::new(interp, Some(image)))
            }
            Self::InProcess(factory) => {
                let interp = factory().map_err(Error::Factory)?;
                Ok(Bootstrapped::new(interp, None))
            }
        }
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Embedded(candidates) => f.debug_tuple("Embedded").field(candidates).finish(),
            Self::InProcess(_) => f.write_str("InProcess"),
        }
    }
}

fn locate(candidates: &[ImageCandidate]) -> Result<(&ImageCandidate, Cow<'static, [u8]>)> {
    for candidate in candidates {
        if let Some(bytes) = candidate.read()? {
            return Ok((candidate, bytes));
        }
    }
    Err(Error::NoImage {
        searched: candidates.iter().map(|c| c.dependency.clone()).collect(),
    })
}

/// A live interpreter together with the image it came from.
///
/// Teardown order: the interpreter is dropped first so the runtime can run its own
/// shutdown, then the image is flushed and unloaded. Shutdown code lives inside the
/// image, so the reverse order would call into unmapped memory.
pub struct Bootstrapped {
    interp: ManuallyDrop<Box<dyn Interpreter>>,
    image: Option<LoadedImage>,
}

impl Bootstrapped {
    fn new(interp: Box<dyn Interpreter>, image: Option<LoadedImage>) -> Self {
        Self {
            interp: ManuallyDrop::new(interp),
            image,
        }
    }

    pub fn interpreter(&self) -> &dyn Interpreter {
        &**self.interp
    }

    pub fn image(&self) -> Option<&LoadedImage> {
        self.image.as_ref()
    }

    /// Whether this instance was loaded with its own symbol resolution.
    pub fn custom_loader(&self) -> bool {
        self.image.as_ref().is_some_and(LoadedImage::custom_loader)
    }
}

impl Drop for Bootstrapped {
    fn drop(&mut self) {
        // Safety: the interpreter is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.interp) };
        drop(self.image.take());
    }
}
