use scada_types::InternalShutdown;
use std::{collections::BTreeMap, os::unix::net::UnixDatagram, path::PathBuf};
use tokio::time::{Duration, Instant};

use crate::RuntimeError;

/// An actor the watchdog expects to hear from at least every `timeout`
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredName {
    pub name: String,
    pub timeout: Duration,
}

impl MonitoredName {
    pub fn new(name: &str, timeout_s: u64) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_secs(timeout_s),
        }
    }
}

/// Internal watchdog. Every actor pats it; an actor silent for longer
/// than its timeout is treated as hung and takes the process down.
pub struct Watchdog {
    pat_period: Duration,
    monitored: BTreeMap<String, (Duration, Instant)>,
}

impl Watchdog {
    pub fn new(seconds_per_pat: f64) -> Self {
        Self {
            pat_period: Duration::from_secs_f64(seconds_per_pat),
            monitored: BTreeMap::new(),
        }
    }

    pub fn pat_period(&self) -> Duration {
        self.pat_period
    }

    pub fn monitor(&mut self, monitored: MonitoredName, now: Instant) {
        self.monitored
            .insert(monitored.name, (monitored.timeout, now));
    }

    /// Checks that every timeout is observed by at least two ticks
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let Some(min_timeout) = self.monitored.values().map(|(t, _)| *t).min() else {
            return Ok(());
        };
        if self.pat_period.is_zero() || self.pat_period >= min_timeout / 2 {
            return Err(RuntimeError::WatchdogConfig {
                seconds_per_pat: self.pat_period.as_secs_f64(),
                min_timeout_s: min_timeout.as_secs_f64(),
            });
        }
        Ok(())
    }

    /// Treat every monitored actor as just heard from
    pub fn restart(&mut self, now: Instant) {
        for (_, last_pat) in self.monitored.values_mut() {
            *last_pat = now;
        }
    }

    pub fn pat(&mut self, name: &str, now: Instant) {
        match self.monitored.get_mut(name) {
            Some((_, last_pat)) => *last_pat = now,
            None => log::debug!("Pat from unmonitored {name}"),
        }
    }

    /// The shutdown to perform if any actor has gone silent
    pub fn check(&self, now: Instant) -> Option<InternalShutdown> {
        self.monitored
            .iter()
            .find(|(_, (timeout, last_pat))| now.duration_since(*last_pat) >= *timeout)
            .map(|(name, (timeout, last_pat))| {
                let elapsed = now.duration_since(*last_pat);
                InternalShutdown {
                    reason: format!(
                        "Actor {name} has not patted the watchdog for {:.1}s (timeout {:.1}s)",
                        elapsed.as_secs_f64(),
                        timeout.as_secs_f64()
                    ),
                    exit_code: InternalShutdown::WATCHDOG_TIMEOUT,
                }
            })
    }
}

/// Pats the service manager's watchdog when running as a supervised
/// service (`$NOTIFY_SOCKET` set)
pub struct SystemdNotifier {
    socket: UnixDatagram,
    path: PathBuf,
}

impl SystemdNotifier {
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os("NOTIFY_SOCKET")?;
        let path = PathBuf::from(path);
        if path.to_string_lossy().starts_with('@') {
            log::warn!("Abstract notify sockets are not supported, not notifying");
            return None;
        }
        match UnixDatagram::unbound() {
            Ok(socket) => Some(Self { socket, path }),
            Err(e) => {
                log::warn!("Unable to open notify socket {e:}");
                None
            }
        }
    }

    pub fn notify(&self, state: &str) {
        if let Err(e) = self.socket.send_to(state.as_bytes(), &self.path) {
            log::warn!("Failed to notify {}: {e:}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_period_must_be_under_half_the_shortest_timeout() {
        let now = Instant::now();
        let mut watchdog = Watchdog::new(1.0);
        watchdog.monitor(MonitoredName::new("s", 10), now);
        watchdog.monitor(MonitoredName::new("vdc-relay", 2), now);
        assert!(matches!(
            watchdog.validate(),
            Err(RuntimeError::WatchdogConfig { .. })
        ));

        let mut watchdog = Watchdog::new(0.5);
        watchdog.monitor(MonitoredName::new("vdc-relay", 2), now);
        assert!(watchdog.validate().is_ok());
    }

    #[test]
    fn silent_actor_trips() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(0.5);
        watchdog.monitor(MonitoredName::new("s", 10), start);
        watchdog.monitor(MonitoredName::new("vdc-relay", 2), start);

        watchdog.pat("s", start + Duration::from_millis(1500));
        assert!(watchdog.check(start + Duration::from_millis(1500)).is_none());

        let shutdown = watchdog.check(start + Duration::from_secs(2)).unwrap();
        assert!(shutdown.reason.contains("vdc-relay"));
        assert!(shutdown.reason.contains("2.0s"));
        assert_eq!(shutdown.exit_code, 5);
    }

    #[test]
    fn pats_keep_it_quiet() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(0.5);
        watchdog.monitor(MonitoredName::new("vdc-relay", 2), start);
        for i in 1..10 {
            let now = start + Duration::from_secs(i);
            watchdog.pat("vdc-relay", now);
            assert!(watchdog.check(now).is_none());
        }
    }
}
