pub mod executor;
pub mod limiter;
pub mod scheduler;
pub mod stall;

pub use executor::*;
pub use limiter::*;
pub use scheduler::*;
pub use stall::*;
