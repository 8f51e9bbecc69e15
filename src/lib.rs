// ABOUTME: Library root for burrow - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod config;
pub mod error;
pub mod pty;
pub mod relay;
pub mod remote_fs;
pub mod scp;
pub mod server;
pub mod ssh;
pub mod tunnel;
