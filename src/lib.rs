pub mod api;
pub mod constants;
pub mod correlator;
pub mod decoder;
pub mod engine;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod reconstruct;
pub mod redaction;
pub mod session;
pub mod specs;
pub mod str_utils;
pub mod summary;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
