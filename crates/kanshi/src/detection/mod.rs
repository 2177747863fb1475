//! Detection module: throttled sampling, inference, motion scoring and
//! event suppression

pub mod dispatcher;
pub mod motion;
pub mod suppress;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherDeps, DispatcherStatus, MOTION_LABEL};
pub use motion::{MotionDetector, MotionReading, MotionSettings};
pub use suppress::Suppressor;
