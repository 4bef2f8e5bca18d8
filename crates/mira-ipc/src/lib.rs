mod client;
mod error;
mod process;
mod sidecar;

pub use client::{SidecarClient, SidecarFactory};
pub use error::{IpcError, Result};
pub use process::{LaunchSpec, ProcessHandle};
pub use sidecar::{SessionFlags, SidecarManager};
