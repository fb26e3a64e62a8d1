//! Screenshot plumbing: visual change detection, the shared frame cache, and
//! the adaptive streamer that keeps the cache fresh.

pub mod cache;
pub mod diff;
pub mod streamer;

pub use cache::FrameCache;
pub use diff::compare_frames;
pub use streamer::{FrameSource, ScreenshotStreamer, StreamerHandle};
