mod download;
mod health;
mod upload;

pub use download::download_file;
pub use health::{health_check, rate_limit_status, readiness_check};
pub use upload::{FILE_FIELD, upload_file};
