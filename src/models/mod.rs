pub mod checkpoint;
pub mod document;
pub mod progress;

pub use checkpoint::*;
pub use document::*;
pub use progress::*;
