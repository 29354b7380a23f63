//! IPC module for operator and harness communication

mod protocol;
mod server;

pub use server::Server;
