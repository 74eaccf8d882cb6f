pub mod progress;

pub use progress::{ChannelProgressSink, LoggingProgressSink, ProgressSink};
