//! Integration tests for adaptive control as configured by the server.
//!
//! The controller itself lives in `relay-core`; these tests exercise it
//! through [`AdaptiveSettings`], the server's config-file representation,
//! to pin the mapping between the two and the hysteresis behaviour an
//! operator actually observes.

use std::time::Duration;

use relay_core::{AdaptiveConfig, AdaptiveController, ControlAction};
use relay_server::domain::config::AdaptiveSettings;

const TICK: Duration = Duration::from_secs(1);

/// Bytes per one-second tick that measure as `kbps` kilobits/second.
fn bytes_for_kbps(kbps: f64) -> u64 {
    (kbps * 1_000.0 / 8.0) as u64
}

fn controller_from(settings: &AdaptiveSettings) -> AdaptiveController {
    let config: AdaptiveConfig = settings.into();
    let mut controller = AdaptiveController::new(config);
    controller.on_first_viewer();
    controller
}

/// A bitrate oscillating just above and just below the ceiling every
/// sample must not cause a parameter change per tick: the trailing average
/// sits at the ceiling, so hysteresis suppresses nearly all of them.
#[test]
fn test_oscillating_bitrate_changes_parameters_rarely() {
    let settings = AdaptiveSettings::default();
    let mut controller = controller_from(&settings);
    let ceiling = settings.bitrate_ceiling_kbps;

    let ticks = 40;
    let mut changes = 0;
    for i in 0..ticks {
        let kbps = if i % 2 == 0 {
            ceiling * 1.05
        } else {
            ceiling * 0.95
        };
        if controller.on_tick(bytes_for_kbps(kbps), TICK).is_some() {
            changes += 1;
        }
    }

    assert!(
        changes < ticks / 2,
        "oscillation must not translate into per-tick changes; saw {changes} in {ticks}"
    );
}

/// A sustained breach of a custom (config-file) ceiling lowers quality by
/// the configured step.
#[test]
fn test_custom_ceiling_from_settings_is_honored() {
    let settings = AdaptiveSettings {
        bitrate_ceiling_kbps: 2_000.0,
        history_len: 3,
        ..AdaptiveSettings::default()
    };
    let mut controller = controller_from(&settings);

    // Three samples at twice the custom ceiling fill the window; the third
    // tick acts.
    assert_eq!(controller.on_tick(bytes_for_kbps(4_000.0), TICK), None);
    assert_eq!(controller.on_tick(bytes_for_kbps(4_000.0), TICK), None);
    let action = controller.on_tick(bytes_for_kbps(4_000.0), TICK);

    assert_eq!(
        action,
        Some(ControlAction::UpdateConfig {
            fps: settings.initial_fps,
            quality: settings.initial_quality - settings.quality_step_down,
        })
    );
}

/// Sustained headroom below `raise_threshold` recovers quality with the
/// configured up-step, which is smaller than the down-step.
#[test]
fn test_recovery_uses_smaller_step_than_throttling() {
    let settings = AdaptiveSettings {
        history_len: 2,
        ..AdaptiveSettings::default()
    };
    let mut controller = controller_from(&settings);

    // Overload until one quality drop.
    controller.on_tick(bytes_for_kbps(12_000.0), TICK);
    let down = controller.on_tick(bytes_for_kbps(12_000.0), TICK);
    assert_eq!(
        down,
        Some(ControlAction::UpdateConfig {
            fps: 30,
            quality: settings.initial_quality - settings.quality_step_down,
        })
    );

    // Near-idle traffic drags the trailing average under the raise
    // threshold; recovery climbs by the smaller up-step.
    let up = controller.on_tick(bytes_for_kbps(100.0), TICK);
    assert_eq!(
        up,
        Some(ControlAction::UpdateConfig {
            fps: 30,
            quality: settings.initial_quality - settings.quality_step_down
                + settings.quality_step_up,
        })
    );
}
