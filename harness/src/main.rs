// Test harness: load a shared object, wire up a host-side resolver and
// exercise its exports from the command line.

mod logger;

use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::process::ExitCode;

use argh::FromArgs;
use libc::{c_char, c_void};
use log::LevelFilter;

/// Load an i386 shared object and poke at its exports.
#[derive(FromArgs)]
struct Args {
    /// path to the shared object
    #[argh(positional)]
    path: PathBuf,

    /// function symbol to call, no arguments, int result
    #[argh(option, default = "String::from(\"fun\")")]
    call: String,

    /// data symbol to read as an int
    #[argh(option, default = "String::from(\"c\")")]
    read: String,

    /// log at debug level
    #[argh(switch, short = 'v')]
    verbose: bool,
}

// Host-side global the image can import as `glob`
static mut HOST_GLOB: i32 = 123;

// External resolver handed to the loader: a couple of host symbols,
// null for everything else.
unsafe extern "C" fn resolve(name: *const c_char) -> *mut c_void {
    let name = unsafe { CStr::from_ptr(name) };
    log::debug!("resolving `{}`", name.to_string_lossy());
    match name.to_bytes() {
        b"glob" => unsafe { &raw mut HOST_GLOB as *mut c_void },
        b"malloc" => libc::malloc as usize as *mut c_void,
        b"free" => libc::free as usize as *mut c_void,
        _ => std::ptr::null_mut(),
    }
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();
    logger::init(if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let lib = match loader::load(&args.path, resolve) {
        Ok(lib) => lib,
        Err(err) => {
            eprintln!("error: failed to load {}: {err}", args.path.display());
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = lib.protect_final() {
        eprintln!("error: failed to apply segment protections: {err}");
        return ExitCode::FAILURE;
    }

    let call = CString::new(args.call).expect("function symbol name contains a NUL");
    let read = CString::new(args.read).expect("data symbol name contains a NUL");

    // Calling into the image only makes sense when we ourselves are i386;
    // on anything else the trampoline does not exist.
    #[cfg(target_arch = "x86")]
    {
        match lib.get_symbol(&call) {
            Some(f) => {
                let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(f.as_ptr()) };
                println!("{}() = {}", call.to_string_lossy(), f());
            }
            None => log::warn!("image does not export `{}`", call.to_string_lossy()),
        }
    }
    #[cfg(not(target_arch = "x86"))]
    {
        log::warn!(
            "not an i386 process; skipping the call to `{}`",
            call.to_string_lossy()
        );
    }

    match lib.get_symbol(&read) {
        Some(p) => {
            let value = unsafe { *(p.as_ptr() as *const i32) };
            println!("{} = {}", read.to_string_lossy(), value);
        }
        None => log::warn!("image does not export `{}`", read.to_string_lossy()),
    }

    ExitCode::SUCCESS
}
