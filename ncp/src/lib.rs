pub mod ctl;
pub mod daemon;
pub mod error;
pub mod imp;
pub mod ipc;
pub mod table;
pub mod timers;
pub mod wire;

pub use daemon::Daemon;
pub use table::DEFAULT_CONNECTIONS;
