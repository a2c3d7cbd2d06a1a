pub use std::pin::Pin;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant};

pub use bytes::Bytes;
pub use tracing::{debug, error, info, trace, warn};
