pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, CredentialStore, Credentials};
pub use error::{Result, ThreadError};
pub use types::*;
