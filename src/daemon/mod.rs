// Daemon side: endpoint derivation, detached bootstrap, shared state, and
// the blocking Unix-socket server.
pub mod endpoint;
pub mod server;
pub mod spawn;
pub mod state;
