mod client;
mod error;
mod events;
mod group;
mod jid;
mod protocol;

pub use client::*;
pub use error::*;
pub use events::*;
pub use group::*;
pub use jid::*;
pub use protocol::*;
