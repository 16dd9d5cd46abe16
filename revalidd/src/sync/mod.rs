pub mod engine;

pub use engine::{DEFAULT_REFRESH_COOLDOWN, SyncEngine, SyncError, SyncOutcome, SyncReport};
