pub mod filename;
pub mod throttle;

pub use filename::sanitize_filename;
pub use throttle::{Delay, Throttle, ThrottleOutcome, TriggerHandler, handler_fn};
