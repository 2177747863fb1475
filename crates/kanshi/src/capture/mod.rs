//! Capture module: frame distribution and stream supervision
//!
//! - [`FrameHub`]: pulls frames from a capture handle, keeps the latest one
//!   and fans out to bounded drop-oldest subscriber queues
//! - [`StreamSupervisor`]: owns the connect/reconnect state machine
//! - Synthetic sources for running without cameras (feature `test-source`)

pub mod backoff;
pub mod fps;
pub mod hub;
pub mod queue;
pub mod supervisor;
#[cfg(feature = "test-source")]
pub mod test_source;

// Re-export commonly used types
pub use backoff::Backoff;
pub use fps::FpsMeter;
pub use hub::{FrameHub, HubStats, PullExit};
pub use queue::{FrameQueue, Subscription, SubscriptionId};
pub use supervisor::{StreamState, StreamStatus, StreamSupervisor, SupervisorConfig};

#[cfg(feature = "test-source")]
pub use test_source::{NullInference, SyntheticCapture};
