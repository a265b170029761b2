// Address arithmetic shared by the mapper and the relocation engine.

use nix::sys::mman::ProtFlags;
use xmas_elf::program::Flags;

// Page size is 4KB; the loader assumes it everywhere
pub const PAGE_SIZE: usize = 0x1000;
const PAGE_MASK: usize = PAGE_SIZE - 1;

// Round an address down to the start of its page
pub fn page_round_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

// Round an address up to the next page boundary (identity on boundaries)
pub fn page_round_up(addr: usize) -> usize {
    page_round_down(addr + PAGE_SIZE - 1)
}

/// Translate ELF segment flags into the mmap protection the segment
/// should end up with once relocations are done.
pub fn segment_prot(flags: Flags) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if flags.is_read() {
        prot |= ProtFlags::PROT_READ;
    }
    if flags.is_write() {
        prot |= ProtFlags::PROT_WRITE;
    }
    if flags.is_execute() {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}
