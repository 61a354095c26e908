// Compiler collaborator seam.
//
// The macro space stores opaque compiled images; producing one from source
// text is the host's business. `HostCompiler` binds to a C-ABI `compile`
// entry point exported by the running process image, resolved lazily so the
// library works in hosts that never compile anything.
use std::ptr;

use crate::core::error::{Error, ErrorKind};

pub trait Compiler {
    fn compile(&self, source: &str) -> Result<Vec<u8>, Error>;
}

/// Expected host entry point:
/// `int compile(const char *source, size_t len, unsigned char **image, size_t *image_len)`.
/// Returns zero on success with `*image` malloc-allocated; the caller frees.
type CompileFn = unsafe extern "C" fn(
    source: *const libc::c_char,
    source_len: libc::size_t,
    image: *mut *mut u8,
    image_len: *mut libc::size_t,
) -> libc::c_int;

pub struct HostCompiler;

impl HostCompiler {
    fn entry_point(&self) -> Result<CompileFn, Error> {
        // dlopen(NULL) hands back the running process image itself.
        let this_process = unsafe { libc::dlopen(ptr::null(), libc::RTLD_LAZY) };
        if this_process.is_null() {
            return Err(Error::new(ErrorKind::Source)
                .with_message("cannot open the process image for symbol lookup"));
        }
        let address = unsafe { libc::dlsym(this_process, c"compile".as_ptr()) };
        if address.is_null() {
            return Err(Error::new(ErrorKind::Source)
                .with_message("this process exports no compile entry point")
                .with_hint("Link a host that provides the C-ABI compile function."));
        }
        Ok(unsafe { std::mem::transmute::<*mut libc::c_void, CompileFn>(address) })
    }
}

impl Compiler for HostCompiler {
    fn compile(&self, source: &str) -> Result<Vec<u8>, Error> {
        let entry = self.entry_point()?;
        let mut image: *mut u8 = ptr::null_mut();
        let mut image_len: libc::size_t = 0;
        let rc = unsafe {
            entry(
                source.as_ptr().cast::<libc::c_char>(),
                source.len(),
                &mut image,
                &mut image_len,
            )
        };
        if rc != 0 || image.is_null() {
            return Err(Error::new(ErrorKind::Source)
                .with_message(format!("compile failed with code {rc}")));
        }
        let bytes = unsafe { std::slice::from_raw_parts(image, image_len) }.to_vec();
        unsafe { libc::free(image.cast::<libc::c_void>()) };
        Ok(bytes)
    }
}
