//! Adaptive screenshot streamer: a self-rescheduling capture loop that slows
//! down on static pages, jumps back to full rate on change, and backs off
//! when captures keep failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use webpilot_core::types::Frame;
use webpilot_core::{AgentEvent, EventSink, Result, StreamerConfig};

use crate::cache::FrameCache;
use crate::diff::compare_frames;

/// Where frames come from. The agent wires this to the gateway's screenshot
/// tool; tests substitute a canned source.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_png(&self) -> Result<Vec<u8>>;
}

/// Capture-rate stepping rules, kept free of I/O.
///
/// Change jumps straight to `max_fps`. After `unchanged_threshold` consecutive
/// unchanged frames, every further unchanged frame steps the rate down by one
/// FPS until `min_fps`.
#[derive(Debug)]
pub struct RateController {
    min_fps: u32,
    max_fps: u32,
    unchanged_threshold: u32,
    fps: u32,
    unchanged_run: u32,
}

impl RateController {
    pub fn new(config: &StreamerConfig) -> Self {
        let min_fps = config.min_fps.max(1);
        let max_fps = config.max_fps.max(min_fps);
        Self {
            min_fps,
            max_fps,
            unchanged_threshold: config.unchanged_threshold,
            fps: max_fps,
            unchanged_run: 0,
        }
    }

    pub fn on_change(&mut self) -> u32 {
        self.unchanged_run = 0;
        self.fps = self.max_fps;
        self.fps
    }

    pub fn on_unchanged(&mut self) -> u32 {
        self.unchanged_run += 1;
        if self.unchanged_run > self.unchanged_threshold {
            let steps = self.unchanged_run - self.unchanged_threshold;
            self.fps = self.max_fps.saturating_sub(steps).max(self.min_fps);
        }
        self.fps
    }

    pub fn reset(&mut self) {
        self.unchanged_run = 0;
        self.fps = self.max_fps;
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }
}

/// Control surface handed to the session. All operations are idempotent.
pub struct StreamerHandle {
    paused: Arc<AtomicBool>,
    token: CancellationToken,
    frames: watch::Receiver<Option<Arc<Frame>>>,
}

impl StreamerHandle {
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Latest-frame channel: a slow consumer only ever sees the newest frame,
    /// superseded frames are never queued.
    pub fn frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frames.clone()
    }
}

pub struct ScreenshotStreamer {
    config: StreamerConfig,
    aa_tolerance: u8,
    source: Arc<dyn FrameSource>,
    cache: Arc<FrameCache>,
    sink: EventSink,
}

impl ScreenshotStreamer {
    pub fn new(
        config: StreamerConfig,
        aa_tolerance: u8,
        source: Arc<dyn FrameSource>,
        cache: Arc<FrameCache>,
        sink: EventSink,
    ) -> Self {
        Self {
            config,
            aa_tolerance,
            source,
            cache,
            sink,
        }
    }

    /// Start the capture loop on the runtime and return its control handle.
    pub fn spawn(self) -> StreamerHandle {
        let paused = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        tokio::spawn(run_loop(
            self.config,
            self.aa_tolerance,
            self.source,
            self.cache,
            self.sink,
            paused.clone(),
            token.clone(),
            tx,
        ));

        StreamerHandle {
            paused,
            token,
            frames: rx,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: StreamerConfig,
    aa_tolerance: u8,
    source: Arc<dyn FrameSource>,
    cache: Arc<FrameCache>,
    sink: EventSink,
    paused: Arc<AtomicBool>,
    token: CancellationToken,
    tx: watch::Sender<Option<Arc<Frame>>>,
) {
    let mut rate = RateController::new(&config);
    let mut failures = 0u32;
    let mut prev_png: Option<Vec<u8>> = None;

    loop {
        if token.is_cancelled() {
            break;
        }
        if paused.load(Ordering::SeqCst) {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
            continue;
        }

        let started = Instant::now();
        // Undecodable bytes count as capture failures too, so a source that
        // keeps producing garbage still reaches the cooldown
        let captured = match source.capture_png().await {
            Ok(png) => match cache.build_frame(png.clone(), config.scaled_width) {
                Ok(frame) => Some((png, frame)),
                Err(e) => {
                    warn!(error = %e, "Capture produced unusable frame");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Screenshot capture failed");
                None
            }
        };

        match captured {
            Some((png, frame)) => {
                failures = 0;
                let changed = match &prev_png {
                    Some(prev) => {
                        let verdict = compare_frames(
                            prev,
                            &png,
                            config.change_threshold_percent,
                            aa_tolerance,
                        );
                        // Degraded comparisons count as unchanged
                        verdict.changed
                    }
                    None => true,
                };
                if changed {
                    rate.on_change();
                } else {
                    rate.on_unchanged();
                }

                sink.emit(AgentEvent::FrameCaptured {
                    width: frame.width,
                    height: frame.height,
                    captured_at: frame.captured_at,
                });
                cache.publish(frame);
                let _ = tx.send(cache.latest());
                prev_png = Some(png);
            }
            None => {
                failures += 1;
                if failures >= config.max_capture_failures {
                    warn!(
                        failures,
                        cooldown_secs = config.failure_cooldown_secs,
                        "Too many consecutive capture failures, cooling down"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(config.failure_cooldown_secs)) => {}
                    }
                    failures = 0;
                    rate.reset();
                    prev_png = None;
                    continue;
                }
            }
        }

        // Drift-compensated sleep: the capture time counts against the tick
        let wait = rate.interval().saturating_sub(started.elapsed());
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Streamer loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};
    use std::sync::atomic::AtomicU32;
    use webpilot_core::Error;

    fn solid_png(color: Rgba<u8>) -> Vec<u8> {
        let img = ImageBuffer::from_pixel(32, 32, color);
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn test_config() -> StreamerConfig {
        StreamerConfig {
            min_fps: 1,
            max_fps: 50,
            unchanged_threshold: 3,
            max_capture_failures: 2,
            failure_cooldown_secs: 60,
            change_threshold_percent: 0.5,
            scaled_width: 32,
        }
    }

    struct CountingSource {
        captures: AtomicU32,
        png: Vec<u8>,
    }

    #[async_trait]
    impl FrameSource for CountingSource {
        async fn capture_png(&self) -> Result<Vec<u8>> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(self.png.clone())
        }
    }

    struct FailingSource {
        captures: AtomicU32,
    }

    #[async_trait]
    impl FrameSource for FailingSource {
        async fn capture_png(&self) -> Result<Vec<u8>> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Err(Error::ToolExecution("no page".into()))
        }
    }

    #[test]
    fn test_rate_steps_down_after_threshold() {
        let mut rate = RateController::new(&StreamerConfig {
            min_fps: 1,
            max_fps: 5,
            unchanged_threshold: 3,
            ..StreamerConfig::default()
        });
        assert_eq!(rate.fps(), 5);
        // First three unchanged frames keep full rate
        assert_eq!(rate.on_unchanged(), 5);
        assert_eq!(rate.on_unchanged(), 5);
        assert_eq!(rate.on_unchanged(), 5);
        // Each further unchanged frame drops one FPS down to the floor
        assert_eq!(rate.on_unchanged(), 4);
        assert_eq!(rate.on_unchanged(), 3);
        assert_eq!(rate.on_unchanged(), 2);
        assert_eq!(rate.on_unchanged(), 1);
        assert_eq!(rate.on_unchanged(), 1);
        // A change snaps back to full rate
        assert_eq!(rate.on_change(), 5);
        assert_eq!(rate.on_unchanged(), 5);
    }

    #[tokio::test]
    async fn test_streamer_publishes_frames() {
        let source = Arc::new(CountingSource {
            captures: AtomicU32::new(0),
            png: solid_png(Rgba([255, 255, 255, 255])),
        });
        let cache = Arc::new(FrameCache::new());
        let streamer = ScreenshotStreamer::new(
            test_config(),
            10,
            source.clone(),
            cache.clone(),
            EventSink::disabled(),
        );
        let handle = streamer.spawn();
        let mut frames = handle.frames();

        tokio::time::timeout(Duration::from_secs(2), frames.changed())
            .await
            .expect("no frame within 2s")
            .unwrap();
        assert!(cache.latest().is_some());
        assert!(source.captures.load(Ordering::SeqCst) >= 1);

        handle.stop();
        handle.stop(); // idempotent
    }

    #[tokio::test]
    async fn test_pause_stops_captures() {
        let source = Arc::new(CountingSource {
            captures: AtomicU32::new(0),
            png: solid_png(Rgba([0, 0, 0, 255])),
        });
        let cache = Arc::new(FrameCache::new());
        let handle = ScreenshotStreamer::new(
            test_config(),
            10,
            source.clone(),
            cache,
            EventSink::disabled(),
        )
        .spawn();

        let mut frames = handle.frames();
        tokio::time::timeout(Duration::from_secs(2), frames.changed())
            .await
            .expect("no frame within 2s")
            .unwrap();

        handle.pause();
        handle.pause(); // idempotent
        assert!(handle.is_paused());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let at_pause = source.captures.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        // At most one in-flight capture may land after the pause flag flips
        assert!(source.captures.load(Ordering::SeqCst) <= at_pause + 1);

        handle.resume();
        assert!(!handle.is_paused());
        handle.stop();
    }

    struct GarbageSource {
        captures: AtomicU32,
    }

    #[async_trait]
    impl FrameSource for GarbageSource {
        async fn capture_png(&self) -> Result<Vec<u8>> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(b"not a png".to_vec())
        }
    }

    #[tokio::test]
    async fn test_undecodable_captures_trigger_cooldown() {
        // A source that returns bytes the decoder rejects must consume the
        // failure budget the same way a failed capture does
        let source = Arc::new(GarbageSource {
            captures: AtomicU32::new(0),
        });
        let cache = Arc::new(FrameCache::new());
        let handle = ScreenshotStreamer::new(
            test_config(), // max_capture_failures: 2, cooldown: 60s
            10,
            source.clone(),
            cache.clone(),
            EventSink::disabled(),
        )
        .spawn();

        let deadline = Instant::now() + Duration::from_secs(2);
        while source.captures.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.captures.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.captures.load(Ordering::SeqCst), 2);
        assert!(cache.latest().is_none());

        handle.stop();
    }

    #[tokio::test]
    async fn test_capture_failures_trigger_cooldown() {
        let source = Arc::new(FailingSource {
            captures: AtomicU32::new(0),
        });
        let cache = Arc::new(FrameCache::new());
        let handle = ScreenshotStreamer::new(
            test_config(), // max_capture_failures: 2, cooldown: 60s
            10,
            source.clone(),
            cache.clone(),
            EventSink::disabled(),
        )
        .spawn();

        // Wait until the failure budget is consumed, then confirm the loop
        // parked in the cooldown instead of hammering the source.
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.captures.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(source.captures.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(source.captures.load(Ordering::SeqCst), 2);
        assert!(cache.latest().is_none());

        handle.stop();
    }
}
