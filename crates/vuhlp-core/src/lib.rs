pub mod approvals;
pub mod cancellation;
pub mod chat;
pub mod config;
pub mod event_bus;
pub mod prompts;
pub mod roles;
pub mod sessions;
pub mod store;

pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";
pub const DEFAULT_DAEMON_PORT: u16 = 4317;

pub use approvals::*;
pub use cancellation::*;
pub use chat::*;
pub use config::*;
pub use event_bus::*;
pub use prompts::*;
pub use roles::*;
pub use sessions::*;
pub use store::*;
