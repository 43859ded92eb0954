pub mod clients;
pub mod errors;
pub mod middleware;
pub mod schema;
pub mod types;

pub use errors::{AppError, AppResult, ErrorCode, LogErr};
pub use types::*;
