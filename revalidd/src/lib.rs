pub mod background;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error;
pub mod notice;
pub mod optimistic;
pub mod service;
pub mod store;
pub mod sync;
pub mod tier;

pub use config::OfflineConfig;
pub use context::OfflineContext;
pub use error::ServiceError;
pub use service::{ApiService, GetOptions};
pub use sync::{SyncEngine, SyncOutcome, SyncReport};
