// Segment mapper: materialize the validated PT_LOAD segments into the
// process's address space.
//
// The whole image span is reserved first with an anonymous PROT_NONE
// mapping at a kernel-chosen address; that address becomes the load bias.
// Each segment is then file-mapped over the reservation as read-write so
// the relocation engine can patch it. The protection the segment actually
// asked for is recorded and applied later (see `Library::protect_final`).

use std::fs::File;
use std::os::unix::io::AsRawFd;

use libc::{c_void, off_t};
use nix::sys::mman::{MapFlags, ProtFlags, mmap};

use crate::LoadError;
use crate::image::ImageInfo;
use crate::layout::{page_round_down, page_round_up};

/// One mapped PT_LOAD segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRecord {
    /// Page-aligned start of the mapping (absolute address)
    pub addr: usize,
    /// Mapping size, a multiple of the page size
    pub size: usize,
    /// Protection the segment declared; the mapping itself is RW until
    /// relocations are done
    pub final_prot: ProtFlags,
}

/// The reserved address range for the image. Unmaps itself on drop until
/// `leak` is called, so every early return during mapping or relocation
/// tears the partial image down.
pub struct Reservation {
    base: usize,
    span: usize,
}

impl Reservation {
    fn reserve(span: usize) -> Result<Self, LoadError> {
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                span,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(LoadError::MappingFailed)?;
        Ok(Reservation {
            base: base as usize,
            span,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn span(&self) -> usize {
        self.span
    }

    /// Hand the range over to the caller; it will never be unmapped.
    pub fn leak(self) -> (usize, usize) {
        let range = (self.base, self.span);
        std::mem::forget(self);
        range
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut c_void, self.span);
        }
    }
}

/// Map every PT_LOAD segment of `info` into a fresh reservation.
///
/// Returns the reservation (still armed for teardown) and one record per
/// segment. The file descriptor stays open; the caller closes it once the
/// image is complete.
pub fn map_image(
    file: &File,
    info: &ImageInfo,
) -> Result<(Reservation, Vec<SegmentRecord>), LoadError> {
    // Segments are in ascending vaddr order, so the last one bounds the span
    let last = info
        .segments
        .last()
        .ok_or(LoadError::InvalidImage("no loadable segments"))?;
    let span = last.vaddr + last.mem_size;

    let reservation = Reservation::reserve(span)?;
    let base = reservation.base();
    let fd = file.as_raw_fd();
    log::debug!("reserved {:#x} bytes at base {:#x}", span, base);

    let mut records = Vec::with_capacity(info.segments.len());
    let mut prev_end = 0usize;
    let mut entry_mapped = false;

    for seg in &info.segments {
        let seg_start = page_round_down(seg.vaddr);
        let seg_end = page_round_up(seg.vaddr + seg.mem_size);
        // Page-rounded segments must not collide with each other
        if seg_start < prev_end {
            return Err(LoadError::InvalidImage("overlapping load segments"));
        }
        prev_end = seg_end;

        let want = base + seg_start;
        let len = seg_end - seg_start;
        let got = unsafe {
            mmap(
                want as *mut c_void,
                len,
                // Writable for now so relocations can be applied
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                fd,
                page_round_down(seg.offset) as off_t,
            )
        }
        .map_err(|_| LoadError::InvalidImage("segment mapping failed"))?;
        if got as usize != want {
            return Err(LoadError::InvalidImage(
                "segment not mapped at the requested address",
            ));
        }
        log::debug!(
            "mapped segment: vaddr={:#x} filesz={:#x} memsz={:#x} at {:#x}",
            seg.vaddr,
            seg.file_size,
            seg.mem_size,
            want
        );

        if seg.executable
            && seg.vaddr <= info.entry
            && info.entry < seg.vaddr + seg.file_size
        {
            entry_mapped = true;
        }

        // Zero-fill tail (BSS)
        if seg.mem_size > seg.file_size {
            if !seg.writable {
                return Err(LoadError::InvalidImage(
                    "zero-fill tail in a read-only segment",
                ));
            }
            let bss_start = seg.vaddr + seg.file_size;
            let bss_page = page_round_up(bss_start);
            // The partial page is file-backed and may hold stale file bytes
            // past p_filesz; zero them by hand.
            unsafe {
                std::ptr::write_bytes((base + bss_start) as *mut u8, 0, bss_page - bss_start);
            }
            // Whole pages past that are replaced with fresh anonymous memory
            if bss_page < seg_end {
                let want = base + bss_page;
                let got = unsafe {
                    mmap(
                        want as *mut c_void,
                        seg_end - bss_page,
                        seg.prot,
                        MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED,
                        -1,
                        0,
                    )
                }
                .map_err(|_| LoadError::InvalidImage("bss mapping failed"))?;
                if got as usize != want {
                    return Err(LoadError::InvalidImage(
                        "bss not mapped at the requested address",
                    ));
                }
            }
        }

        records.push(SegmentRecord {
            addr: base + seg_start,
            size: len,
            final_prot: seg.prot,
        });
    }

    if !entry_mapped {
        log::debug!(
            "entry point {:#x} is not inside an executable mapping",
            info.entry
        );
    }

    Ok((reservation, records))
}
