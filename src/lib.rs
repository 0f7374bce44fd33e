pub mod api;
pub mod bridge;
pub mod command;
pub mod config;
pub mod errors;
pub mod machine;
pub mod models;
pub mod network;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use api::build_router;
pub use reaper::IdleReaper;
pub use registry::SessionRegistry;

pub const DEFAULT_HTTP_PORT: u16 = 8080;
