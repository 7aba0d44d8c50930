//! Per-client stream engine.
//!
//! Every connected socket owns one producer task pacing snapshot → encode →
//! emit at the client's target fps. The task and the router share a
//! [`StreamState`] behind a plain mutex: the router applies settings updates,
//! pause/resume, and latency reports; the producer reads the effective
//! parameters each tick and applies fps-based adaptation. Control messages on
//! the mailbox only wake the task — all policy lives in the state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time::Instant;
use uuid::Uuid;

use periscope_protocol::{
    ConnectionClass, DeviceClass, Frame, InitRequest, Outbound, PeriscopeConfig, ServerEvent,
    SettingsRequest, StreamPreset, StreamSettings, StreamSnapshot, codec,
};

use crate::driver::{BrowserDriver, SnapshotOptions};
use crate::pool::{BrowserPool, PoolError};

/// A stream restarted more than this long after its last frame opens with a
/// forced keyframe.
const STALE_RESUME: Duration = Duration::from_secs(1);

/// Configured bounds and defaults the adaptation logic clamps against.
#[derive(Debug, Clone, Copy)]
pub struct StreamLimits {
    pub min_fps: u32,
    pub max_fps: u32,
    pub default_fps: u32,
    pub min_quality: u32,
    pub max_quality: u32,
    pub default_quality: u32,
    pub adaptive_default: bool,
}

impl StreamLimits {
    pub fn from_config(config: &PeriscopeConfig) -> Self {
        Self {
            min_fps: config.streaming.min_fps,
            max_fps: config.streaming.max_fps,
            default_fps: config.streaming.default_fps,
            min_quality: config.streaming.min_quality,
            max_quality: config.streaming.max_quality,
            default_quality: config.browser.screenshot_quality,
            adaptive_default: config.features.adaptive_streaming,
        }
    }
}

/// Mutable state of one client's stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    pub socket_id: Uuid,
    pub browser_id: Uuid,
    pub active: bool,
    pub target_fps: u32,
    pub quality: u32,
    pub keyframe_interval: u32,
    pub keyframe_counter: u64,
    pub frame_count: u64,
    pub bytes_sent: u64,
    pub observed_latency_ms: Option<f64>,
    pub adaptive: bool,
    pub connection_class: ConnectionClass,
    pub device_class: DeviceClass,
    limits: StreamLimits,
}

pub type SharedStream = Arc<Mutex<StreamState>>;

/// Frame parameters decided at the top of a producer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub is_keyframe: bool,
    pub quality: u32,
}

impl StreamState {
    /// Derive the initial state from the class presets, then client
    /// overrides, then the configured bounds.
    pub fn new(socket_id: Uuid, browser_id: Uuid, init: &InitRequest, limits: StreamLimits) -> Self {
        let connection_class = init.connection_quality.unwrap_or_default();
        let device_class = init.device_class.unwrap_or_default();
        let preset = StreamPreset::for_client(connection_class, device_class);

        let target_fps = init
            .fps
            .unwrap_or(preset.fps)
            .clamp(limits.min_fps, limits.max_fps);
        let quality = init
            .quality
            .unwrap_or(preset.quality)
            .clamp(limits.min_quality, limits.max_quality);

        Self {
            socket_id,
            browser_id,
            active: true,
            target_fps,
            quality,
            keyframe_interval: preset.keyframe_interval,
            keyframe_counter: 0,
            frame_count: 0,
            bytes_sent: 0,
            observed_latency_ms: None,
            adaptive: init.adaptive_bitrate.unwrap_or(limits.adaptive_default),
            connection_class,
            device_class,
            limits,
        }
    }

    pub fn settings(&self) -> StreamSettings {
        StreamSettings {
            fps: self.target_fps,
            quality: self.quality,
            adaptive_bitrate: self.adaptive,
        }
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot {
            active: self.active,
            fps: self.target_fps,
            quality: self.quality,
            frame_count: self.frame_count,
            bytes_sent: self.bytes_sent,
            connection_class: self.connection_class,
            device_class: self.device_class,
        }
    }

    /// Validate and clamp a settings update. Any effective change resets the
    /// keyframe counter so the next frame is self-contained at the new
    /// parameters.
    pub fn apply_update(&mut self, req: &SettingsRequest) -> bool {
        let mut changed = false;

        if let Some(connection) = req.connection_quality
            && connection != self.connection_class
        {
            self.connection_class = connection;
            self.keyframe_interval =
                StreamPreset::for_client(connection, self.device_class).keyframe_interval;
            changed = true;
        }
        if let Some(fps) = req.fps {
            let fps = fps.clamp(self.limits.min_fps, self.limits.max_fps);
            if fps != self.target_fps {
                self.target_fps = fps;
                changed = true;
            }
        }
        if let Some(quality) = req.quality {
            let quality = quality.clamp(self.limits.min_quality, self.limits.max_quality);
            if quality != self.quality {
                self.quality = quality;
                changed = true;
            }
        }
        if let Some(adaptive) = req.adaptive_bitrate
            && adaptive != self.adaptive
        {
            self.adaptive = adaptive;
            changed = true;
        }

        if changed {
            self.keyframe_counter = 0;
        }
        changed
    }

    /// Fold a client latency report into fps/quality. The number is a
    /// drift-biased hint (client clock vs. server timestamps), so it only
    /// nudges the ladder, one step per report.
    pub fn apply_latency_report(&mut self, latency_ms: f64) {
        self.observed_latency_ms = Some(latency_ms);
        if !self.adaptive {
            return;
        }

        if latency_ms > 200.0 {
            self.quality = self.quality.saturating_sub(5).max(self.limits.min_quality);
            self.target_fps = self.target_fps.saturating_sub(2).max(self.limits.min_fps);
        } else if latency_ms > 100.0 {
            self.quality = self.quality.saturating_sub(2).max(self.limits.min_quality);
        } else {
            // Recovery climbs back toward the defaults, never past them
            if self.quality < self.limits.default_quality {
                self.quality += 1;
            }
            if self.target_fps < self.limits.default_fps {
                self.target_fps += 1;
            }
        }
    }

    /// Adjust quality from the observed inter-frame interval.
    pub fn adapt_after_frame(&mut self, elapsed_ms: f64) {
        if !self.adaptive || elapsed_ms <= 0.0 {
            return;
        }
        let observed_fps = 1000.0 / elapsed_ms;
        let target = f64::from(self.target_fps);

        if observed_fps < 0.9 * target && self.quality > self.limits.min_quality {
            self.quality = self.quality.saturating_sub(5).max(self.limits.min_quality);
        } else if observed_fps > 1.1 * target && self.quality < self.limits.max_quality {
            self.quality = (self.quality + 2).min(self.limits.max_quality);
        }
    }

    /// Decide the next frame's keyframe flag and quality.
    pub fn next_frame_meta(&mut self) -> FrameMeta {
        let is_keyframe = self.keyframe_counter % u64::from(self.keyframe_interval) == 0;
        self.keyframe_counter += 1;
        FrameMeta {
            is_keyframe,
            quality: self.quality,
        }
    }

    /// Make the next frame a keyframe.
    pub fn force_keyframe(&mut self) {
        self.keyframe_counter = 0;
    }
}

/// Wakeups for the producer task. State changes travel through the shared
/// [`StreamState`]; the mailbox exists so a parked or sleeping task notices
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Wake,
    Shutdown,
}

pub fn lock(state: &SharedStream) -> std::sync::MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// The per-client producer loop: snapshot → encode → emit, paced to the
/// target fps.
///
/// Exits on `Shutdown`, on a closed mailbox or outbound channel (transport
/// gone), and on capture failure — a broken capture path produces garbage
/// forever, so terminating and letting the client reinitialise is the
/// correct degradation.
pub async fn run_producer<D: BrowserDriver>(
    state: SharedStream,
    pool: Arc<BrowserPool<D>>,
    base_opts: SnapshotOptions,
    outbound: mpsc::Sender<Outbound>,
    mut commands: mpsc::Receiver<StreamCommand>,
) {
    let started = Instant::now();
    let socket_id = lock(&state).socket_id;
    let mut last_emit: Option<Instant> = None;

    tracing::debug!(%socket_id, "Producer loop started");

    loop {
        // Apply any queued wakeups before deciding whether to park
        loop {
            match commands.try_recv() {
                Ok(StreamCommand::Wake) => {}
                Ok(StreamCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    tracing::debug!(%socket_id, "Producer loop shut down");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let is_parked = !lock(&state).active;
        if is_parked {
            // Parked: nothing to do until the router wakes us
            match commands.recv().await {
                Some(StreamCommand::Wake) => {
                    let mut st = lock(&state);
                    if st.active && last_emit.is_none_or(|t| t.elapsed() > STALE_RESUME) {
                        st.force_keyframe();
                    }
                    continue;
                }
                Some(StreamCommand::Shutdown) | None => {
                    tracing::debug!(%socket_id, "Producer loop shut down while paused");
                    return;
                }
            }
        }
        let (browser_id, target_fps, meta) = {
            let mut st = lock(&state);
            let meta = st.next_frame_meta();
            (st.browser_id, st.target_fps, meta)
        };

        let tick_started = Instant::now();
        let raw = match pool
            .snapshot(
                browser_id,
                SnapshotOptions {
                    quality: meta.quality,
                    ..base_opts
                },
            )
            .await
        {
            Ok(raw) => raw,
            Err(PoolError::NotFound(_)) => {
                tracing::info!(%socket_id, %browser_id, "Browser gone, stopping stream");
                return;
            }
            Err(e) => {
                tracing::warn!(%socket_id, %browser_id, "Capture failed, terminating stream: {e}");
                return;
            }
        };

        let encoded = codec::encode(&raw);
        let frame = Frame {
            image: encoded.payload,
            is_keyframe: meta.is_keyframe,
            quality: meta.quality,
            timestamp: started.elapsed().as_millis() as u64,
        };

        // Frames are volatile: drop under backpressure rather than stall
        match outbound.try_send(Outbound::Event(ServerEvent::Frame(frame))) {
            Ok(()) => {
                let mut st = lock(&state);
                st.frame_count += 1;
                st.bytes_sent += encoded.byte_len as u64;
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(%socket_id, "Outbound channel full, dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                // Transport gone; the router handles cleanup
                return;
            }
        }

        let now = Instant::now();
        if let Some(prev) = last_emit {
            let elapsed_ms = now.duration_since(prev).as_secs_f64() * 1000.0;
            lock(&state).adapt_after_frame(elapsed_ms);
        }
        last_emit = Some(now);

        let budget = Duration::from_millis(1000 / u64::from(target_fps.max(1)));
        let sleep_for = budget
            .saturating_sub(tick_started.elapsed())
            .max(Duration::from_millis(1));

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            cmd = commands.recv() => match cmd {
                Some(StreamCommand::Wake) => {}
                Some(StreamCommand::Shutdown) | None => {
                    tracing::debug!(%socket_id, "Producer loop shut down");
                    return;
                }
            },
        }
    }
}
