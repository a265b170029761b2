// Lazy binding: the PLT trampoline and the resolver it dispatches to.
//
// Unbound PLT slots point back into their stub; the stub pushes the slot's
// relocation offset and jumps through GOT[2], which we aim at the
// trampoline below. GOT[1] carries the `DynContext` pointer so the
// trampoline can find the resolver and the image's tables without any
// relocation of its own.

use libc::c_char;

use crate::ExternResolver;
use crate::dynamic::{self, Elf32Dyn, Elf32Rel, Elf32Sym};

/// Runtime state the trampoline needs on every unbound call.
///
/// Heap-resident and pinned for the life of the image: GOT[1] stores its
/// raw address. The layout contract with the trampoline is that the
/// resolver entry point is the FIRST field; everything after it is only
/// touched from Rust.
#[repr(C)]
#[derive(Debug)]
pub struct DynContext {
    /// C-level lazy resolver; the trampoline calls through this slot
    pub resolver_entry: unsafe extern "C" fn(*mut DynContext, u32) -> u32,
    /// Load bias of the image
    pub base: usize,
    /// Mapped PT_DYNAMIC segment
    pub dyn_section: *const Elf32Dyn,
    /// Base of the PLT relocation array (DT_JMPREL), null if absent
    pub plt_relocations: *const Elf32Rel,
    /// Dynamic symbol table in the mapped image
    pub symbols: *const Elf32Sym,
    /// Dynamic string table in the mapped image
    pub strtab: *const c_char,
    /// Symbol count, from the hash table's nchain word
    pub nsyms: usize,
    /// Caller-supplied fallback for symbols not defined in the image
    pub extern_resolver: ExternResolver,
}

/// C-level half of lazy binding, invoked by the trampoline with the
/// context pointer and the byte offset the PLT stub pushed.
///
/// Looks up the relocation entry, resolves the symbol, patches the GOT
/// slot and returns the target address for the trampoline to jump to.
pub unsafe extern "C" fn lazy_resolve(ctx: *mut DynContext, reloc_offset: u32) -> u32 {
    let ctx = unsafe { &*ctx };
    let rel =
        unsafe { &*((ctx.plt_relocations as usize + reloc_offset as usize) as *const Elf32Rel) };
    let name = dynamic::symbol_name(ctx, rel.symbol_index());

    let addr = dynamic::resolve_symbol(ctx, name);
    if addr == 0 {
        // The returned jump target is null; the call will fault. Nothing
        // better to do this late, the caller is already past the PLT.
        log::warn!("lazy binding failed for `{}`", name.to_string_lossy());
    } else {
        log::trace!(
            "bound `{}` to {:#x} (slot {:#x})",
            name.to_string_lossy(),
            addr,
            rel.r_offset
        );
    }

    // Subsequent calls go straight to the target
    unsafe {
        *((ctx.base + rel.r_offset as usize) as *mut u32) = addr;
    }
    addr
}

/// First-call entry stub the PLT jumps to via GOT[2].
///
/// On entry the stack holds, top first:
///   - context pointer (GOT[1], pushed by the first PLT entry)
///   - relocation offset (pushed by the symbol's own stub)
///   - return address of the original caller
///   - the original call's arguments
///
/// The resolver address is read out of the context's first field rather
/// than referenced directly, so this stub needs no relocation itself. On
/// exit every register is as the caller left it and `ret` lands in the
/// resolved target with the original return address and arguments on top.
#[cfg(target_arch = "x86")]
#[unsafe(naked)]
extern "C" fn plt_trampoline() {
    core::arch::naked_asm!(
        // Keep the caller's registers intact across the resolver call
        "pushad",
        // Stack room for the resolver's two cdecl arguments
        "sub esp, 8",
        // Relocation offset -> second argument
        "mov eax, [esp + 44]",
        "mov [esp + 4], eax",
        // Context pointer -> first argument
        "mov eax, [esp + 40]",
        "mov [esp], eax",
        // First context field is the resolver entry point
        "mov eax, [eax]",
        "call eax",
        "add esp, 8",
        // Park the resolved target in the relocation-offset slot
        "mov [esp + 36], eax",
        "popad",
        // Drop the context slot; ret then jumps into the target
        "add esp, 4",
        "ret",
    )
}

/// Address to install in GOT[2].
#[cfg(target_arch = "x86")]
pub fn trampoline_addr() -> usize {
    plt_trampoline as *const () as usize
}

/// Lazy binding only exists on i386; a foreign-architecture build can map
/// and inspect images but never call into them.
#[cfg(not(target_arch = "x86"))]
pub fn trampoline_addr() -> usize {
    0
}

// The trampoline hard-codes where it finds the resolver slot
const _: () = assert!(std::mem::offset_of!(DynContext, resolver_entry) == 0);
