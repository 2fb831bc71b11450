//! Concrete execution backends.

pub mod http;
pub mod page;

pub use http::{HttpBackend, HttpBackendConfig};
