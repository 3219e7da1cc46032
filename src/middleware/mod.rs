//! HTTP middleware for upload admission.
//!
//! Request IDs, tracing and CORS come from `tower-http` and are wired in
//! [`crate::routes`]. This module holds the admission layer mounted on the
//! upload routes only:
//!
//! ```text
//! POST /, /api/upload → Admission → upload handler
//!                          ↓
//!                  429 / 400 / 503 with X-RateLimit-* headers
//! ```

pub mod admission;

pub use admission::{AdmissionTicket, UploadedBytes, apply_limit_headers, upload_admission};
