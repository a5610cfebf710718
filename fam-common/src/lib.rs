pub mod config;
pub mod error;
pub mod model;
pub mod wire;

pub use error::{FamError, FamResult};
