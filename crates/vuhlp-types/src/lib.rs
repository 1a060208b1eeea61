pub mod error;
pub mod event;
pub mod model;

pub use error::*;
pub use event::*;
pub use model::*;

use chrono::{DateTime, Utc};

/// Prefixed unique id, e.g. `run_5f3a…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4())
}

/// Wall-clock timestamp used for every entity and event.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
