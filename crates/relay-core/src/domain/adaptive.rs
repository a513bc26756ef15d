//! Adaptive delivery controller: closes the loop between measured delivery
//! bitrate and the producer's capture parameters.
//!
//! # State machine
//!
//! ```text
//!          FirstViewerJoined
//! Idle ───────────────────────► Active ──┐ tick: re-measure bitrate,
//!   ▲                             │      │ adjust quality/FPS
//!   └─────────────────────────────┘◄─────┘
//!          LastViewerLeft
//! ```
//!
//! In `Idle` the producer is told to stop capturing; in `Active` a periodic
//! tick recomputes the measured bitrate from bytes sent since the last tick
//! and compares the trailing average of the newest samples against the
//! configured ceiling:
//!
//! - average above the ceiling: lower JPEG quality first; once quality sits
//!   at its floor, lower the target FPS.
//! - average below `raise_threshold` of the ceiling: raise quality first,
//!   then FPS.
//! - otherwise: leave the parameters alone.
//!
//! Adjustments wait for a full measurement window, and raising requires the
//! whole trailing average (not one idle sample) to show headroom. Both
//! rules exist to keep bursty traffic from thrashing the quality level up
//! and down on every tick.
//!
//! The controller never touches a clock or timer itself. The server drives
//! [`AdaptiveController::on_tick`] from its own interval task and passes
//! the measured elapsed time, which is also what lets tests feed synthetic
//! bitrate histories deterministically.

use std::collections::VecDeque;
use std::time::Duration;

/// Tuning knobs for the adaptive controller, normally taken from the
/// `[adaptive]` section of the relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Maximum sustained delivery rate the controller targets per stream.
    pub bitrate_ceiling_kbps: f64,
    /// Number of bitrate samples in the trailing window.
    pub history_len: usize,
    /// Fraction of the ceiling below which the trailing average must sit
    /// before quality or FPS may be raised.
    pub raise_threshold: f64,
    pub quality_min: u8,
    pub quality_max: u8,
    /// Subtracted from quality on each over-ceiling adjustment.
    pub quality_step_down: u8,
    /// Added to quality on each headroom adjustment. Smaller than the down
    /// step so recovery is gradual.
    pub quality_step_up: u8,
    pub fps_min: u32,
    pub fps_max: u32,
    pub fps_step: u32,
    pub initial_quality: u8,
    pub initial_fps: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            bitrate_ceiling_kbps: 10_000.0,
            history_len: 10,
            raise_threshold: 0.7,
            quality_min: 40,
            quality_max: 95,
            quality_step_down: 5,
            quality_step_up: 2,
            fps_min: 1,
            fps_max: 30,
            fps_step: 1,
            initial_quality: 75,
            initial_fps: 30,
        }
    }
}

/// Whether the producer has been signalled to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Active,
}

/// Mutable control variables for one stream. Mutated only by the
/// controller; read by the protocol handler to report current throttling.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveState {
    pub target_fps: u32,
    pub jpeg_quality: u8,
    /// Most recent per-tick measurement in kilobits per second.
    pub measured_bitrate_kbps: f64,
    /// Newest `history_len` measurements, oldest first.
    pub bitrate_history: VecDeque<f64>,
}

/// Command the controller wants pushed to the producer connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlAction {
    StartCapture,
    StopCapture,
    UpdateConfig { fps: u32, quality: u8 },
}

/// Per-stream closed-loop controller.
#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    capture: CaptureState,
    state: AdaptiveState,
}

impl AdaptiveController {
    pub fn new(config: AdaptiveConfig) -> Self {
        let state = AdaptiveState {
            target_fps: config.initial_fps,
            jpeg_quality: config.initial_quality,
            measured_bitrate_kbps: 0.0,
            bitrate_history: VecDeque::with_capacity(config.history_len),
        };
        Self {
            config,
            capture: CaptureState::Idle,
            state,
        }
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture
    }

    pub fn state(&self) -> &AdaptiveState {
        &self.state
    }

    pub fn target_fps(&self) -> u32 {
        self.state.target_fps
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.state.jpeg_quality
    }

    /// Transition on `FirstViewerJoined`: tell the producer to start
    /// capturing at the current parameters. A no-op when already active.
    pub fn on_first_viewer(&mut self) -> Vec<ControlAction> {
        if self.capture == CaptureState::Active {
            return Vec::new();
        }
        self.capture = CaptureState::Active;
        vec![
            ControlAction::StartCapture,
            ControlAction::UpdateConfig {
                fps: self.state.target_fps,
                quality: self.state.jpeg_quality,
            },
        ]
    }

    /// Transition on `LastViewerLeft`: stop capture and drop the stale
    /// measurement window. A no-op when already idle.
    pub fn on_last_viewer(&mut self) -> Vec<ControlAction> {
        if self.capture == CaptureState::Idle {
            return Vec::new();
        }
        self.capture = CaptureState::Idle;
        self.state.bitrate_history.clear();
        self.state.measured_bitrate_kbps = 0.0;
        vec![ControlAction::StopCapture]
    }

    /// Periodic measurement tick. `bytes_sent` is the delivered byte count
    /// since the previous tick; `elapsed` the wall time the window covers.
    ///
    /// Returns the `config_update` to push to the producer when a
    /// parameter changed, or `None`.
    pub fn on_tick(&mut self, bytes_sent: u64, elapsed: Duration) -> Option<ControlAction> {
        if self.capture != CaptureState::Active || elapsed.is_zero() {
            return None;
        }

        let kbps = (bytes_sent as f64 * 8.0 / 1_000.0) / elapsed.as_secs_f64();
        self.state.measured_bitrate_kbps = kbps;
        self.state.bitrate_history.push_back(kbps);
        while self.state.bitrate_history.len() > self.config.history_len {
            self.state.bitrate_history.pop_front();
        }

        // Act only on a full trailing window so a single burst or a single
        // idle sample cannot move the parameters.
        if self.state.bitrate_history.len() < self.config.history_len {
            return None;
        }

        let average = self.state.bitrate_history.iter().sum::<f64>()
            / self.state.bitrate_history.len() as f64;
        let ceiling = self.config.bitrate_ceiling_kbps;

        let before = (self.state.jpeg_quality, self.state.target_fps);

        if average > ceiling {
            self.throttle_down();
        } else if average < ceiling * self.config.raise_threshold {
            self.throttle_up();
        }

        let after = (self.state.jpeg_quality, self.state.target_fps);
        if after == before {
            return None;
        }

        tracing::info!(
            average_kbps = average,
            ceiling_kbps = ceiling,
            quality = self.state.jpeg_quality,
            fps = self.state.target_fps,
            "adaptive parameters adjusted"
        );
        Some(ControlAction::UpdateConfig {
            fps: self.state.target_fps,
            quality: self.state.jpeg_quality,
        })
    }

    /// Quality gives way first; FPS only drops once quality sits at its
    /// floor.
    fn throttle_down(&mut self) {
        if self.state.jpeg_quality > self.config.quality_min {
            self.state.jpeg_quality = self
                .state
                .jpeg_quality
                .saturating_sub(self.config.quality_step_down)
                .max(self.config.quality_min);
        } else if self.state.target_fps > self.config.fps_min {
            self.state.target_fps = self
                .state
                .target_fps
                .saturating_sub(self.config.fps_step)
                .max(self.config.fps_min);
        }
    }

    /// Recovery mirrors the throttle order: quality back up first, FPS
    /// after quality has fully recovered.
    fn throttle_up(&mut self) {
        if self.state.jpeg_quality < self.config.quality_max {
            self.state.jpeg_quality = self
                .state
                .jpeg_quality
                .saturating_add(self.config.quality_step_up)
                .min(self.config.quality_max);
        } else if self.state.target_fps < self.config.fps_max {
            self.state.target_fps = self
                .state
                .target_fps
                .saturating_add(self.config.fps_step)
                .min(self.config.fps_max);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
