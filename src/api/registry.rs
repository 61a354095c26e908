//! Purpose: Client facade over the three callback-binding registries.
//! Exports: `Registry` operations, the `ModuleBackend` seam, and the OS
//! Exports: dynamic-loader backend.
//! Role: Registration state lives in the daemon; entry-point resolution is
//! Role: purely client-side through the module backend.
//! Invariants: A resolve failure is indistinguishable from an absent
//! Invariants: registration; both report `NotFound`.
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Mutex, OnceLock};

use tracing::debug;

use crate::api::context::ClientContext;
use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Binding, CallbackType, RegistrationEntry};
use crate::core::wire::{Request, Subsystem, op};

/// Dynamic module loading seam. The OS backend wraps the platform loader;
/// tests substitute an in-memory symbol table.
pub trait ModuleBackend {
    /// Load (or find already loaded) a library, returning an opaque handle.
    fn load(&self, library: &str) -> Result<u64, Error>;
    /// Resolve one symbol in a loaded library to an entry-point address.
    fn lookup(&self, module: u64, symbol: &str) -> Result<u64, Error>;
}

pub struct Registry<'a> {
    context: &'a ClientContext,
}

impl<'a> Registry<'a> {
    pub(crate) fn new(context: &'a ClientContext) -> Self {
        Self { context }
    }

    /// Register a lazy library binding. An existing `(type, name)` key is
    /// left untouched; the return value reports the collision.
    pub fn register_library(
        &self,
        kind: CallbackType,
        name: &str,
        library: &str,
        procedure: &str,
        user_data: Vec<u8>,
        drop_authority: bool,
    ) -> Result<bool, Error> {
        self.register(
            kind,
            name,
            RegistrationEntry {
                binding: Binding::Library {
                    library: library.to_string(),
                    procedure: procedure.to_string(),
                },
                user_data,
                drop_authority,
            },
        )
    }

    /// Register an eager in-process entry point.
    pub fn register_entry_point(
        &self,
        kind: CallbackType,
        name: &str,
        entry_point: u64,
        user_data: Vec<u8>,
    ) -> Result<bool, Error> {
        self.register(
            kind,
            name,
            RegistrationEntry {
                binding: Binding::EntryPoint(entry_point),
                user_data,
                drop_authority: true,
            },
        )
    }

    fn register(
        &self,
        kind: CallbackType,
        name: &str,
        entry: RegistrationEntry,
    ) -> Result<bool, Error> {
        let response = self.context.call_expect_ok(
            &Request::new(Subsystem::Registry, op::registry::REGISTER)
                .with_params([kind.as_u64(), 0, 0])
                .with_name(name)
                .with_payload(entry.encode()?),
        )?;
        Ok(response.params[0] != 0)
    }

    /// Remove a registration. A library qualifier restricts the drop to a
    /// binding against that library; a drop-protected registration is
    /// refused with `AccessDenied`.
    pub fn drop(
        &self,
        kind: CallbackType,
        name: &str,
        library: Option<&str>,
    ) -> Result<(), Error> {
        self.context
            .call_expect_ok(&qualified_request(op::registry::DROP, kind, name, library))?;
        Ok(())
    }

    /// Whether `(type, name)` is registered, and its user data if so.
    pub fn query(
        &self,
        kind: CallbackType,
        name: &str,
        library: Option<&str>,
    ) -> Result<Option<Vec<u8>>, Error> {
        let response = self
            .context
            .call_expect_ok(&qualified_request(op::registry::QUERY, kind, name, library))?;
        if response.params[0] == 0 {
            return Ok(None);
        }
        Ok(Some(response.payload))
    }

    pub fn fetch(
        &self,
        kind: CallbackType,
        name: &str,
        library: Option<&str>,
    ) -> Result<RegistrationEntry, Error> {
        let response = self
            .context
            .call_expect_ok(&qualified_request(op::registry::FETCH, kind, name, library))?;
        RegistrationEntry::decode(&response.payload)
    }

    /// Resolve a registration to a callable entry point. Pointer bindings
    /// return the stored value without touching the loader; library bindings
    /// go through the module backend. Absence and resolution failure are
    /// deliberately reported the same way; transport faults pass through
    /// unchanged.
    pub fn resolve(
        &self,
        kind: CallbackType,
        name: &str,
        library: Option<&str>,
        modules: &dyn ModuleBackend,
    ) -> Result<u64, Error> {
        let entry = self.fetch(kind, name, library).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                not_registered(name).with_source(err)
            } else {
                err
            }
        })?;
        match entry.binding {
            Binding::EntryPoint(address) => Ok(address),
            Binding::Library { library, procedure } => {
                resolve_symbol(modules, &library, &procedure)
                    .map_err(|err| not_registered(name).with_source(err))
            }
        }
    }
}

fn not_registered(name: &str) -> Error {
    Error::new(ErrorKind::NotFound).with_message(format!("no callable registration for {name}"))
}

fn qualified_request(
    opcode: u8,
    kind: CallbackType,
    name: &str,
    library: Option<&str>,
) -> Request {
    let mut request = Request::new(Subsystem::Registry, opcode)
        .with_params([kind.as_u64(), 0, 0])
        .with_name(name);
    if let Some(library) = library {
        request.params[1] = 1;
        request.payload = library.as_bytes().to_vec();
    }
    request
}

/// Look up the exact procedure name, then retry once upper-cased.
pub fn resolve_symbol(
    backend: &dyn ModuleBackend,
    library: &str,
    procedure: &str,
) -> Result<u64, Error> {
    let module = backend.load(library)?;
    match backend.lookup(module, procedure) {
        Ok(address) => Ok(address),
        Err(_) => {
            let upper = procedure.to_ascii_uppercase();
            debug!(library, procedure, "exact symbol missing, retrying upper-cased");
            backend.lookup(module, &upper)
        }
    }
}

/// Platform dynamic loader with a process-wide cache of loaded modules.
pub struct OsModuleBackend;

fn module_cache() -> &'static Mutex<HashMap<String, u64>> {
    static CACHE: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A bare library name becomes `lib<name>.so`; anything carrying a path
/// separator or extension is used verbatim.
fn library_candidates(library: &str) -> Vec<String> {
    if library.contains('/') || library.contains('.') {
        vec![library.to_string()]
    } else {
        vec![format!("lib{library}.so"), library.to_string()]
    }
}

impl ModuleBackend for OsModuleBackend {
    fn load(&self, library: &str) -> Result<u64, Error> {
        let mut cache = module_cache()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(&module) = cache.get(library) {
            return Ok(module);
        }
        for candidate in library_candidates(library) {
            let Ok(name) = CString::new(candidate) else {
                continue;
            };
            let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_LAZY) };
            if !handle.is_null() {
                let module = handle as u64;
                cache.insert(library.to_string(), module);
                return Ok(module);
            }
        }
        Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("cannot load library {library}"))
            .with_hint("Check the library name and the loader search path."))
    }

    fn lookup(&self, module: u64, symbol: &str) -> Result<u64, Error> {
        let name = CString::new(symbol).map_err(|_| {
            Error::new(ErrorKind::BadArgument).with_message("symbol name contains NUL")
        })?;
        let address = unsafe { libc::dlsym(module as *mut libc::c_void, name.as_ptr()) };
        if address.is_null() {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message(format!("symbol {symbol} not found")));
        }
        Ok(address as u64)
    }
}
