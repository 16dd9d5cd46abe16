mod client;

pub use client::{ApiClient, ApiError, FileDescriptor, HttpMethod, extract_error_message};

pub use reqwest::StatusCode;
