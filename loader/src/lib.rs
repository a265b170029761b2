//! Userspace loader for 32-bit i386 ELF shared objects.
//!
//! Maps a position-independent `.so` into the current process, applies its
//! data relocations eagerly, wires the PLT up for lazy binding and hands
//! back a [`Library`] for symbol lookup. Symbols the image does not define
//! are fielded by a caller-supplied resolver callback.

use std::ffi::CStr;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::ptr::NonNull;

use libc::{c_char, c_void};
use nix::sys::mman::mprotect;
use thiserror::Error;

mod dynamic;
mod image;
mod layout;
mod lazy;
mod segments;

use lazy::DynContext;
pub use segments::SegmentRecord;

/// Caller-supplied fallback for symbols the image does not define.
/// Returns the symbol's absolute address, or null if unknown.
pub type ExternResolver = unsafe extern "C" fn(*const c_char) -> *mut c_void;

/// Everything that can go wrong during a load. A failed load leaves no
/// mappings behind.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to open image: {0}")]
    FileOpen(#[source] std::io::Error),
    #[error("invalid image: {0}")]
    InvalidImage(&'static str),
    #[error("address-space reservation failed: {0}")]
    MappingFailed(nix::Error),
    #[error("invalid relocation: {0}")]
    InvalidRelocation(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A successfully loaded image. Lives until the process exits; dropping
/// the handle does not unmap anything.
#[derive(Debug)]
pub struct Library {
    base: usize,
    span: usize,
    segments: Vec<SegmentRecord>,
    ctx: &'static DynContext,
}

/// Map the shared object at `path` into the current process and relocate
/// it. `resolver` is consulted for every symbol the image needs but does
/// not define, both at load time and on first calls through the PLT.
pub fn load<P: AsRef<Path>>(path: P, resolver: ExternResolver) -> Result<Library, LoadError> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(LoadError::FileOpen)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let info = image::inspect(&data)?;
    log::debug!(
        "loading {} ({} load segments)",
        path.display(),
        info.segments.len()
    );

    // Reservation unmaps the whole image on any early return below
    let (reservation, records) = segments::map_image(&file, &info)?;

    let ctx = dynamic::relocate(
        reservation.base(),
        reservation.span(),
        info.dynamic_vaddr,
        resolver,
    )?;

    // The file backing the private mappings is no longer needed; a failed
    // close still counts as a failed load
    nix::unistd::close(file.into_raw_fd()).map_err(|e| LoadError::Io(nix_error_to_io(e)))?;

    let (base, span) = reservation.leak();
    log::info!("loaded {} at base {:#x}", path.display(), base);

    Ok(Library {
        base,
        span,
        segments: records,
        // The context must stay addressable for as long as anything can
        // call into the image, i.e. forever
        ctx: Box::leak(ctx),
    })
}

impl Library {
    /// Look a symbol up in the image's dynamic symbol table. Only symbols
    /// the image itself defines are returned; there is no fallback to the
    /// external resolver here.
    pub fn get_symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        match dynamic::lookup_symbol(self.ctx, name) {
            dynamic::Lookup::Defined(value) => {
                NonNull::new((self.base + value as usize) as *mut c_void)
            }
            _ => None,
        }
    }

    /// Load bias of the image.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total bytes reserved at `base`.
    pub fn span(&self) -> usize {
        self.span
    }

    /// The mapped PT_LOAD segments, in ascending address order.
    pub fn segments(&self) -> &[SegmentRecord] {
        &self.segments
    }

    /// Drop every segment from the relocation-time RW mapping down to the
    /// protection its program header declared. Call once relocations are
    /// no longer expected to write anywhere they should not.
    pub fn protect_final(&self) -> Result<(), LoadError> {
        for seg in &self.segments {
            unsafe { mprotect(seg.addr as *mut c_void, seg.size, seg.final_prot) }
                .map_err(LoadError::MappingFailed)?;
            log::debug!(
                "segment at {:#x} tightened to {:?}",
                seg.addr,
                seg.final_prot
            );
        }
        Ok(())
    }
}

fn nix_error_to_io(err: nix::Error) -> std::io::Error {
    match err.as_errno() {
        Some(errno) => std::io::Error::from_raw_os_error(errno as i32),
        None => std::io::Error::new(std::io::ErrorKind::Other, err),
    }
}
