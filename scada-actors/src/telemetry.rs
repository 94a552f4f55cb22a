use scada_types::{HardwareLayout, SingleReading, Snapshot};
use std::collections::BTreeMap;

/// Readings older than this many capture periods are no longer served
pub const FLATLINE_FACTOR: f64 = 2.1;

#[derive(Debug)]
struct Channel {
    capture_period_ms: i64,
    last: Option<SingleReading>,
    flatlined: bool,
}

impl Channel {
    fn is_fresh(&self, now_ms: i64) -> bool {
        self.last.as_ref().is_some_and(|r| {
            (now_ms - r.scada_read_time_unix_ms) as f64
                <= self.capture_period_ms as f64 * FLATLINE_FACTOR
        })
    }
}

/// Last known good value per data channel captured by one node
#[derive(Debug, Default)]
pub struct TelemetryTracker {
    channels: BTreeMap<String, Channel>,
}

impl TelemetryTracker {
    /// Tracks every data channel `captured_by` is responsible for
    pub fn new(layout: &HardwareLayout, captured_by: &str) -> Self {
        let channels = layout
            .data_channels
            .iter()
            .filter(|c| c.captured_by_node_name == captured_by)
            .map(|c| {
                (
                    c.name.clone(),
                    Channel {
                        capture_period_ms: c.capture_period_s() as i64 * 1000,
                        last: None,
                        flatlined: false,
                    },
                )
            })
            .collect();
        Self { channels }
    }

    /// Returns false for channels this tracker does not know
    pub fn record(&mut self, reading: SingleReading) -> bool {
        match self.channels.get_mut(&reading.channel_name) {
            Some(channel) => {
                if channel.flatlined {
                    log::info!("Channel {} is reporting again", reading.channel_name);
                    channel.flatlined = false;
                }
                channel.last = Some(reading);
                true
            }
            None => false,
        }
    }

    pub fn latest(&self, channel_name: &str, now_ms: i64) -> Option<&SingleReading> {
        self.channels
            .get(channel_name)
            .filter(|c| c.is_fresh(now_ms))
            .and_then(|c| c.last.as_ref())
    }

    /// Channels that went stale since the last check
    pub fn newly_flatlined(&mut self, now_ms: i64) -> Vec<String> {
        self.channels
            .iter_mut()
            .filter(|(_, c)| !c.flatlined && !c.is_fresh(now_ms))
            .map(|(name, c)| {
                c.flatlined = true;
                name.clone()
            })
            .collect()
    }

    /// Every fresh reading; flatlined channels are left out
    pub fn snapshot(&self, gnode_alias: &str, now_ms: i64) -> Snapshot {
        Snapshot {
            from_gnode_alias: gnode_alias.to_string(),
            snapshot_time_unix_ms: now_ms,
            readings: self
                .channels
                .values()
                .filter(|c| c.is_fresh(now_ms))
                .filter_map(|c| c.last.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::layout;

    const T0: i64 = 1_700_000_000_000;

    fn reading(value: i64, at: i64) -> SingleReading {
        SingleReading {
            channel_name: "hp-odu-pwr".to_string(),
            value,
            scada_read_time_unix_ms: at,
        }
    }

    #[test]
    fn tracks_only_its_channels() {
        let mut tracker = TelemetryTracker::new(&layout(), "s");
        assert!(tracker.record(reading(4000, T0)));
        assert!(!tracker.record(SingleReading {
            channel_name: "dist-flow".to_string(),
            value: 1,
            scada_read_time_unix_ms: T0,
        }));
        assert!(TelemetryTracker::new(&layout(), "relay-multiplexer")
            .snapshot("x", T0)
            .readings
            .is_empty());
    }

    #[test]
    fn serves_last_known_good_then_flatlines() {
        let mut tracker = TelemetryTracker::new(&layout(), "s");
        tracker.record(reading(4000, T0));

        // capture period is 10s, so values are served for 21s
        assert_eq!(tracker.latest("hp-odu-pwr", T0 + 21_000).unwrap().value, 4000);
        assert!(tracker.newly_flatlined(T0 + 21_000).is_empty());
        assert_eq!(tracker.snapshot("s", T0 + 21_000).readings.len(), 1);

        assert!(tracker.latest("hp-odu-pwr", T0 + 21_001).is_none());
        assert_eq!(tracker.newly_flatlined(T0 + 21_001), vec!["hp-odu-pwr"]);
        assert!(tracker.newly_flatlined(T0 + 30_000).is_empty());
        assert!(tracker.snapshot("s", T0 + 30_000).readings.is_empty());

        tracker.record(reading(3500, T0 + 30_000));
        let snapshot = tracker.snapshot("s", T0 + 31_000);
        assert_eq!(snapshot.readings[0].value, 3500);
        assert_eq!(snapshot.from_gnode_alias, "s");
    }

    #[test]
    fn never_read_channel_is_flatlined() {
        let mut tracker = TelemetryTracker::new(&layout(), "s");
        assert_eq!(tracker.newly_flatlined(T0), vec!["hp-odu-pwr"]);
    }
}
