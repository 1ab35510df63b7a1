//! Server-side backbone of a real-time collaborative document editor: a
//! WebSocket gateway that authenticates editors, routes them into
//! per-document rooms, merges CRDT updates into an authoritative replica,
//! persists durable state and enforces access control.

pub mod config;
pub mod gateway;
pub mod registry;
pub mod room;
pub mod session;

#[cfg(test)]
mod tests_scenarios;

pub use config::ServerConfig;
pub use gateway::{router, serve, AppState, SessionTable};
pub use registry::RoomRegistry;
