use crate::config::TelemetryConfig;
use crate::events::{MusicalEvent, ScheduledEvent};
use crate::project::Project;
use crate::timing::{TELEMETRY_TRACK, beats_to_ticks};

/// Bars are counted from the start of the session.
pub fn bar_markers(
    config: &TelemetryConfig,
    project: &Project,
    cycle_index: u64,
    resolution: u32,
) -> Vec<ScheduledEvent> {
    if !config.bar_cc_enabled {
        return Vec::new();
    }

    let beats_per_bar = project.beats_per_bar();
    let first_bar = cycle_index.saturating_mul(project.cycle_bars as u64);
    let channel = config.telemetry_channel;
    let mut markers = Vec::new();

    for bar in 0..project.cycle_bars as u64 {
        let global = first_bar + bar;
        let beat = bar as f64 * beats_per_bar;
        let tick = beats_to_ticks(beat, resolution);
        let mut push = |controller: u8, value: u8| {
            let cc =
                MusicalEvent::control_change(TELEMETRY_TRACK, channel, controller, value, beat);
            markers.push(ScheduledEvent::new(tick, cc, None));
        };

        push(config.bar_cc_index, (global % 128) as u8);
        if let Some(total) = project.total_bars {
            let remaining = (total as u64).saturating_sub(global).min(127);
            push(config.bar_cc_countdown, remaining as u8);
        }
        if let Some(section) = project.sections.iter().find(|s| s.bar as u64 == global) {
            push(config.bar_cc_section, section.marker);
        }
    }
    markers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::project::Section;
    use crate::project::fixtures::groove;

    fn enabled() -> TelemetryConfig {
        TelemetryConfig {
            bar_cc_enabled: true,
            ..Default::default()
        }
    }

    fn values(markers: &[ScheduledEvent]) -> Vec<(i64, u8, u8)> {
        markers
            .iter()
            .map(|e| match e.payload.kind {
                EventKind::ControlChange { controller, value } => (e.tick, controller, value),
                _ => panic!("telemetry must be control changes"),
            })
            .collect()
    }

    #[test]
    fn disabled_by_default() {
        assert!(bar_markers(&TelemetryConfig::default(), &groove(), 0, 480).is_empty());
    }

    #[test]
    fn marks_every_bar_of_the_cycle() {
        let mut project = groove();
        project.cycle_bars = 2;
        project.total_bars = Some(6);
        project.sections = vec![Section { bar: 3, marker: 2 }];

        let markers = bar_markers(&enabled(), &project, 1, 480);
        assert_eq!(
            values(&markers),
            vec![(0, 20, 2), (0, 21, 4), (1920, 20, 3), (1920, 21, 3), (1920, 22, 2)]
        );
        assert!(markers.iter().all(|e| e.payload.channel == 15));
        assert!(markers.iter().all(|e| e.payload.track_id == TELEMETRY_TRACK));
    }

    #[test]
    fn open_ended_sessions_have_no_countdown() {
        let mut project = groove();
        project.total_bars = None;
        let markers = bar_markers(&enabled(), &project, 130, 480);
        assert_eq!(values(&markers), vec![(0, 20, 2)]);
    }
}
