pub mod agent;
pub mod api;
pub mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
pub mod debug;
pub mod persist;
pub mod ports;
pub mod process;
pub mod pty;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod terminal;
pub mod upload;
pub mod worktree;
