pub mod discovery;
pub mod health;
pub mod matches;
pub mod messages;
pub mod notifications;
pub mod swipes;

use validator::Validate;

use rally_shared::errors::{AppError, AppResult, ErrorCode};

pub(crate) fn validated<T: Validate>(request: T) -> AppResult<T> {
    request
        .validate()
        .map_err(|e| AppError::new(ErrorCode::ValidationError, e.to_string()))?;
    Ok(request)
}
