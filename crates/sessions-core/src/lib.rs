pub mod action;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod io;
pub mod launcher;
pub mod offload;
pub mod paths;
pub mod poller;
pub mod raw;
pub mod registry;
pub mod template;
pub mod types;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SessionsError};
