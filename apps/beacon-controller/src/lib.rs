//! Controller side of beacon: accepts agents, keeps a handle-addressed registry
//! of them and exposes an operator console.

pub mod config;
pub mod console;
pub mod listener;
pub mod registry;
pub mod supervisor;
pub mod telemetry;

pub use config::{Cli, ControllerConfig};
pub use console::Console;
pub use listener::{handle_connection, serve, ListenerConfig};
pub use registry::{ClientView, Handle, Installed, Registry, RegistryError};
pub use supervisor::spawn_supervisor;
