pub mod client;
pub mod config;
pub mod context;
pub mod contracts;
pub mod error;
pub mod models;
pub mod services;

pub use context::CommerceContext;
pub use error::{CommerceError, Result};
