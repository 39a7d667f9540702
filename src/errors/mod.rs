pub mod app_error;
pub mod auth_error;

pub use app_error::{AppError, AppResult, ErrorBody};
pub use auth_error::{AuthError, AuthResult};
