// Relocation engine: walk the dynamic section of the mapped image, find
// the symbol machinery, apply the eager relocations and prime the PLT for
// lazy binding.
//
// Everything here operates on the mapped image, not on the file buffer:
// all addresses stored in dynamic entries are file-relative and become
// real pointers once biased by the mapping base.

use std::collections::HashMap;
use std::ffi::{CStr, CString};

use libc::c_char;

use crate::LoadError;
use crate::lazy::{self, DynContext};

// Dynamic-section entry tags (Elf32_Dyn.d_tag)
const DT_NULL: i32 = 0;
const DT_PLTRELSZ: i32 = 2;
const DT_PLTGOT: i32 = 3;
const DT_HASH: i32 = 4;
const DT_STRTAB: i32 = 5;
const DT_SYMTAB: i32 = 6;
const DT_REL: i32 = 17;
const DT_RELSZ: i32 = 18;
const DT_RELENT: i32 = 19;
const DT_JMPREL: i32 = 23;

// i386 relocation types (ELF32_R_TYPE of Elf32_Rel.r_info)
const R_386_32: u8 = 1;
const R_386_PC32: u8 = 2;
const R_386_GLOB_DAT: u8 = 6;
const R_386_JMP_SLOT: u8 = 7;
const R_386_RELATIVE: u8 = 8;

// Symbol types (low nibble of Elf32_Sym.st_info)
const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;

// Elf32_Rel entries are 8 bytes; DT_RELENT must agree
const REL_ENTRY_SIZE: usize = 8;

// Dynamic-section entry as it sits in the mapped image
#[repr(C)]
pub struct Elf32Dyn {
    pub d_tag: i32, // entry kind (DT_*)
    pub d_val: u32, // value or file-relative address, depending on the tag
}

// REL-form relocation entry; the addend lives in the target word
#[repr(C)]
pub struct Elf32Rel {
    pub r_offset: u32, // file-relative address of the word to patch
    pub r_info: u32,   // symbol index (high 24 bits) and type (low 8)
}

impl Elf32Rel {
    pub fn r_type(&self) -> u8 {
        self.r_info as u8
    }

    pub fn symbol_index(&self) -> usize {
        (self.r_info >> 8) as usize
    }
}

// Dynamic symbol-table entry
#[repr(C)]
pub struct Elf32Sym {
    pub st_name: u32,  // offset into the dynamic string table
    pub st_value: u32, // file-relative address of the symbol
    pub st_size: u32,
    pub st_info: u8, // binding (high nibble) and type (low nibble)
    pub st_other: u8,
    pub st_shndx: u16,
}

impl Elf32Sym {
    pub fn st_type(&self) -> u8 {
        self.st_info & 0xf
    }
}

/// Result of scanning the dynamic symbol table for a name.
pub enum Lookup {
    /// Defined in this image; carries the file-relative offset
    Defined(u32),
    /// Declared here but undefined (STT_NOTYPE); ask the external resolver
    Undefined,
    NotFound,
}

/// Linear scan of the dynamic symbol table.
pub fn lookup_symbol(ctx: &DynContext, name: &CStr) -> Lookup {
    for index in 0..ctx.nsyms {
        let sym = unsafe { &*ctx.symbols.add(index) };
        let kind = sym.st_type();
        if kind != STT_OBJECT && kind != STT_FUNC && kind != STT_NOTYPE {
            continue;
        }
        let sym_name = unsafe { CStr::from_ptr(ctx.strtab.add(sym.st_name as usize)) };
        if sym_name == name {
            if kind == STT_NOTYPE {
                return Lookup::Undefined;
            }
            return Lookup::Defined(sym.st_value);
        }
    }
    Lookup::NotFound
}

/// Resolve a name to an absolute address: locally defined symbols win,
/// everything else goes to the external resolver. Zero means unresolved.
pub fn resolve_symbol(ctx: &DynContext, name: &CStr) -> u32 {
    match lookup_symbol(ctx, name) {
        Lookup::Defined(value) => (ctx.base as u32).wrapping_add(value),
        Lookup::Undefined | Lookup::NotFound => unsafe {
            (ctx.extern_resolver)(name.as_ptr()) as usize as u32
        },
    }
}

// Same as `resolve_symbol`, but external results are cached so the
// resolver sees each distinct name at most once per load.
fn resolve_cached(ctx: &DynContext, cache: &mut HashMap<CString, u32>, name: &CStr) -> u32 {
    match lookup_symbol(ctx, name) {
        Lookup::Defined(value) => (ctx.base as u32).wrapping_add(value),
        Lookup::Undefined | Lookup::NotFound => *cache
            .entry(name.to_owned())
            .or_insert_with(|| unsafe { (ctx.extern_resolver)(name.as_ptr()) as usize as u32 }),
    }
}

/// Name of the symbol a relocation entry refers to.
pub fn symbol_name<'a>(ctx: &'a DynContext, index: usize) -> &'a CStr {
    unsafe {
        let sym = &*ctx.symbols.add(index);
        CStr::from_ptr(ctx.strtab.add(sym.st_name as usize))
    }
}

// Only these types consume the resolved symbol address
fn needs_symbol(kind: u8) -> bool {
    matches!(kind, R_386_32 | R_386_PC32 | R_386_GLOB_DAT)
}

// Compute the patched word for one relocation. `word` is the current
// content of the target, `place` its absolute address, `s` the resolved
// symbol address (0 when the type ignores it). None for unknown types.
fn relocated_value(kind: u8, word: u32, s: u32, place: u32, base: u32) -> Option<u32> {
    match kind {
        R_386_32 => Some(word.wrapping_add(s)),
        R_386_PC32 => Some(word.wrapping_add(s).wrapping_sub(place)),
        R_386_GLOB_DAT => Some(s),
        // Rebase only: JMP_SLOT words keep pointing back into the PLT so
        // the first call goes through the binder
        R_386_RELATIVE | R_386_JMP_SLOT => Some(word.wrapping_add(base)),
        _ => None,
    }
}

// Patch one relocation target in the mapped image.
fn apply(base: usize, span: usize, rel: &Elf32Rel, s: u32) -> Result<(), LoadError> {
    let offset = rel.r_offset as usize;
    if offset + 4 > span {
        return Err(LoadError::InvalidRelocation(format!(
            "relocation target {:#x} outside the image",
            rel.r_offset
        )));
    }
    let place = (base + offset) as *mut u32;
    let word = unsafe { place.read() };
    let Some(patched) = relocated_value(rel.r_type(), word, s, place as u32, base as u32) else {
        return Err(LoadError::InvalidRelocation(format!(
            "unknown relocation type {}",
            rel.r_type()
        )));
    };
    unsafe { place.write(patched) };
    Ok(())
}

/// Walk the dynamic section, install the lazy-binding hooks and apply all
/// load-time relocations.
///
/// Returns the binding context the PLT trampoline dispatches through; its
/// address is already installed in GOT[1] when this returns.
pub fn relocate(
    base: usize,
    span: usize,
    dynamic_vaddr: usize,
    resolver: crate::ExternResolver,
) -> Result<Box<DynContext>, LoadError> {
    let dyn_start = (base + dynamic_vaddr) as *const Elf32Dyn;

    // Boxed before the walk: GOT[1] gets this heap address and the PLT
    // stubs push it on every unbound call, so it must never move.
    let mut ctx = Box::new(DynContext {
        resolver_entry: lazy::lazy_resolve,
        base,
        dyn_section: dyn_start,
        plt_relocations: std::ptr::null(),
        symbols: std::ptr::null(),
        strtab: std::ptr::null(),
        nsyms: 0,
        extern_resolver: resolver,
    });
    let ctx_addr = ctx.as_ref() as *const DynContext as usize;

    let mut hash = None;
    let mut strtab = None;
    let mut symtab = None;
    let mut rel = None;
    let mut rel_bytes = 0usize;
    let mut plt = None;
    let mut plt_bytes = 0usize;

    let mut entry = dyn_start;
    loop {
        let dyn_entry = unsafe { &*entry };
        match dyn_entry.d_tag {
            DT_NULL => break,
            DT_HASH => hash = Some(base + dyn_entry.d_val as usize),
            DT_STRTAB => strtab = Some(base + dyn_entry.d_val as usize),
            DT_SYMTAB => symtab = Some(base + dyn_entry.d_val as usize),
            DT_REL => rel = Some(base + dyn_entry.d_val as usize),
            DT_RELSZ => rel_bytes = dyn_entry.d_val as usize,
            DT_JMPREL => plt = Some(base + dyn_entry.d_val as usize),
            DT_PLTRELSZ => plt_bytes = dyn_entry.d_val as usize,
            DT_RELENT => {
                if dyn_entry.d_val as usize != REL_ENTRY_SIZE {
                    return Err(LoadError::InvalidRelocation(format!(
                        "relocation entry size {} (expected {})",
                        dyn_entry.d_val, REL_ENTRY_SIZE
                    )));
                }
            }
            DT_PLTGOT => {
                let got = dyn_entry.d_val as usize;
                if got + 12 > span {
                    return Err(LoadError::InvalidRelocation(
                        "pltgot outside the image".into(),
                    ));
                }
                // GOT[1]: pushed by the PLT as the binder's context.
                // GOT[2]: where the PLT jumps on an unbound call.
                unsafe {
                    *((base + got + 4) as *mut u32) = ctx_addr as u32;
                    *((base + got + 8) as *mut u32) = lazy::trampoline_addr() as u32;
                }
                log::trace!("installed binding hooks in got at {:#x}", base + got);
            }
            _ => {}
        }
        entry = unsafe { entry.add(1) };
    }

    let (Some(hash), Some(strtab), Some(symtab)) = (hash, strtab, symtab) else {
        return Err(LoadError::InvalidRelocation(
            "dynamic section lacks DT_HASH, DT_STRTAB, or DT_SYMTAB".into(),
        ));
    };

    // Second word of the hash table (nchain) equals the symbol count
    let nsyms = unsafe { *((hash + 4) as *const u32) } as usize;

    ctx.symbols = symtab as *const Elf32Sym;
    ctx.strtab = strtab as *const c_char;
    ctx.nsyms = nsyms;
    if let Some(plt) = plt {
        ctx.plt_relocations = plt as *const Elf32Rel;
    }

    // Eager data relocations first
    let mut cache: HashMap<CString, u32> = HashMap::new();
    if let Some(rel) = rel {
        for i in 0..rel_bytes / REL_ENTRY_SIZE {
            let rel_entry = unsafe { &*((rel + i * REL_ENTRY_SIZE) as *const Elf32Rel) };
            let s = if needs_symbol(rel_entry.r_type()) {
                let name = symbol_name(&ctx, rel_entry.symbol_index());
                let addr = resolve_cached(&ctx, &mut cache, name);
                if addr == 0 {
                    return Err(LoadError::InvalidRelocation(format!(
                        "unresolved symbol `{}`",
                        name.to_string_lossy()
                    )));
                }
                addr
            } else {
                0
            };
            apply(base, span, rel_entry, s)?;
        }
        log::debug!("applied {} data relocations", rel_bytes / REL_ENTRY_SIZE);
    }

    // Then prime the PLT slots: the stored words are file-relative
    // addresses back into the PLT and only need the base bias. Name
    // resolution happens on first call.
    if let Some(plt) = plt {
        for i in 0..plt_bytes / REL_ENTRY_SIZE {
            let rel_entry = unsafe { &*((plt + i * REL_ENTRY_SIZE) as *const Elf32Rel) };
            apply(base, span, rel_entry, 0)?;
        }
        log::debug!("primed {} plt slots", plt_bytes / REL_ENTRY_SIZE);
    }

    Ok(ctx)
}
