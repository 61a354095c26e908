// Well-known daemon endpoint derivation.
//
// Clients and daemon agree on a socket path with no prior coordination: the
// name is a deterministic digest of host, uid, and login session, placed in
// the user runtime directory.
use std::ffi::CStr;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

pub const ENDPOINT_ENV: &str = "CROSSBAR_ENDPOINT";

/// Resolve the endpoint: explicit override, else the derived well-known path.
pub fn default_endpoint() -> PathBuf {
    if let Some(path) = std::env::var_os(ENDPOINT_ENV) {
        return PathBuf::from(path);
    }
    runtime_dir().join(derived_socket_name(
        &hostname(),
        uid(),
        login_session().as_deref(),
    ))
}

pub fn derived_socket_name(host: &str, uid: u32, session: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(uid.to_le_bytes());
    if let Some(session) = session {
        hasher.update(session.as_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in &digest[..8] {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    format!("crossbar-{hex}.sock")
}

pub fn runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len() - 1) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let cstr = unsafe { CStr::from_ptr(buf.as_ptr().cast::<libc::c_char>()) };
    cstr.to_string_lossy().into_owned()
}

fn uid() -> u32 {
    unsafe { libc::getuid() }
}

fn login_session() -> Option<String> {
    std::env::var("XDG_SESSION_ID").ok()
}
