// Header validation: decide whether a file is something we are willing to
// map before any address-space state is touched.

use nix::sys::mman::ProtFlags;
use xmas_elf::ElfFile;
use xmas_elf::header::{Class, Machine, Type as ElfType};
use xmas_elf::program::Type;

use crate::LoadError;
use crate::layout;

// Upper bound on program headers we accept; anything larger is garbage
pub const MAX_PHNUM: u16 = 100;

/// One PT_LOAD program header, reduced to the fields the mapper needs.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    pub vaddr: usize,
    pub mem_size: usize,
    pub file_size: usize,
    pub offset: usize,
    pub writable: bool,
    pub executable: bool,
    pub prot: ProtFlags,
}

/// Everything the rest of the load pipeline needs to know about the file.
pub struct ImageInfo {
    /// PT_LOAD segments in file order (the ELF spec requires ascending vaddr)
    pub segments: Vec<LoadSegment>,
    /// File-relative address of the PT_DYNAMIC segment
    pub dynamic_vaddr: usize,
    /// File-relative entry point, informational only for a shared object
    pub entry: usize,
}

/// Parse and validate the ELF header and program-header table.
///
/// Accepts exactly the images the loader can handle: 32-bit i386 ET_DYN
/// with a sane program-header table whose first PT_LOAD starts at vaddr 0.
pub fn inspect(data: &[u8]) -> Result<ImageInfo, LoadError> {
    let elf = ElfFile::new(data).map_err(LoadError::InvalidImage)?;

    if elf.header.pt1.class() != Class::ThirtyTwo {
        return Err(LoadError::InvalidImage("not a 32-bit image"));
    }
    if elf.header.pt2.machine().as_machine() != Machine::X86 {
        return Err(LoadError::InvalidImage("not an i386 image"));
    }
    if elf.header.pt2.type_().as_type() != ElfType::SharedObject {
        return Err(LoadError::InvalidImage("not a shared object"));
    }
    if elf.header.pt2.ph_count() > MAX_PHNUM {
        return Err(LoadError::InvalidImage("too many program headers"));
    }

    let mut segments = Vec::new();
    let mut dynamic_vaddr = None;
    for ph in elf.program_iter() {
        match ph.get_type() {
            Ok(Type::Load) => segments.push(LoadSegment {
                vaddr: ph.virtual_addr() as usize,
                mem_size: ph.mem_size() as usize,
                file_size: ph.file_size() as usize,
                offset: ph.offset() as usize,
                writable: ph.flags().is_write(),
                executable: ph.flags().is_execute(),
                prot: layout::segment_prot(ph.flags()),
            }),
            Ok(Type::Dynamic) => dynamic_vaddr = Some(ph.virtual_addr() as usize),
            // Notes, GNU extensions etc. are none of our business
            _ => {}
        }
    }

    if segments.is_empty() {
        return Err(LoadError::InvalidImage("no loadable segments"));
    }
    // All file-relative addresses are biased by the mapping base later on,
    // which only works out if the image starts at vaddr 0.
    if segments[0].vaddr != 0 {
        return Err(LoadError::InvalidImage(
            "first load segment does not start at vaddr 0",
        ));
    }
    let Some(dynamic_vaddr) = dynamic_vaddr else {
        return Err(LoadError::InvalidImage("no dynamic segment"));
    };

    Ok(ImageInfo {
        segments,
        dynamic_vaddr,
        entry: elf.header.pt2.entry_point() as usize,
    })
}
