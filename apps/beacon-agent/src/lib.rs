//! Agent side of beacon: dials the controller and answers its requests with
//! facts about the host and the effects of commands run on it.

pub mod capability;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod runtime;
pub mod telemetry;

pub use capability::{Capability, CapabilityError, HostCapability};
pub use config::{AgentConfig, Cli};
pub use dispatch::{DispatchError, Dispatcher};
pub use identity::{HostIdentity, IdentitySource};
pub use runtime::{run, serve_connection, ConnectionError};
