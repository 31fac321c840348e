mod log_utils;

pub use log_utils::log_init;
// re-export the tracing macros so dependents log through a single crate
pub use tracing::{debug, error, info, trace, warn};
