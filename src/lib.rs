pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod notify;
pub mod orchestration;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
