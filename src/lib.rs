pub mod client;
mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod shutdown;
pub mod supervisor;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{BotApi, TeloxideClient};
pub use config::{Config, Environment};
pub use router::Router;
pub use shutdown::ShutdownSignal;
pub use supervisor::{Supervisor, SupervisorHandle, SupervisorSettings, SupervisorState};
