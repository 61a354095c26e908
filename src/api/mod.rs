//! Purpose: Define the stable public client API boundary for Crossbar.
//! Exports: The process context, the three subsystem facades, and the
//! Exports: collaborator seams (compiler, module backend).
//! Role: Public, additive-only surface; hides transport and daemon modules.
//! Invariants: This module is the only public path to client operations.
//! Invariants: All daemon traffic flows through `ClientContext`.

mod compiler;
mod context;
mod macros;
mod pool;
mod queues;
mod registry;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::model::{Binding, CallbackType, InsertOrder, RegistrationEntry};
pub use crate::core::name::{MAX_QUEUE_NAME, SESSION_ALIAS, validate_queue_name};
pub use compiler::{Compiler, HostCompiler};
pub use context::{ClientContext, SESSION_ENV};
pub use macros::{MacroImage, MacroSpace};
pub use pool::{Connection, ConnectionPool, POOL_SIZE_ENV};
pub use queues::{PulledEntry, Queues};
pub use registry::{ModuleBackend, OsModuleBackend, Registry};
