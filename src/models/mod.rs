mod api;

pub use api::{HealthResponse, UploadResponse};
