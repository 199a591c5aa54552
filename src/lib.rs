pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod fs_util;
pub mod ldap;
pub mod orchestrator;
pub mod runtime_env;
pub mod secrets;
pub mod vault;

pub use error::{BootstrapError, Provisioned, Result};
