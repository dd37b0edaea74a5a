pub mod agent;
pub mod api;
pub mod artifacts;
pub mod config;
pub mod core;
pub mod daemon;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use error::{Error, Result};
