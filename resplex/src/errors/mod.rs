//! The error types used across the crate.

mod driver_error;
mod server_error;

pub use driver_error::{Error, ErrorKind, RespResult};
pub use server_error::ServerError;
