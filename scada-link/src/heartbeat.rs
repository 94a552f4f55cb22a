use rand::Rng;
use scada_types::Heartbeat;

/// Tracks the rolling hex digit exchanged with a peer. Each heartbeat we
/// send carries a fresh digit the peer must echo back in its own
/// `YourLastHex` before `response_timeout_ms` elapses.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    interval_ms: i64,
    response_timeout_ms: i64,
    my_hex: char,
    your_last_hex: char,
    last_sent_ms: Option<i64>,
    last_received_ms: i64,
    /// Set when a heartbeat goes out, cleared when the peer echoes it
    awaiting_echo_since_ms: Option<i64>,
    starting_over: bool,
}

impl HeartbeatTracker {
    pub fn new(interval_s: u64, response_timeout_s: u64) -> Self {
        Self {
            interval_ms: (interval_s * 1000) as i64,
            response_timeout_ms: (response_timeout_s * 1000) as i64,
            my_hex: '0',
            your_last_hex: '0',
            last_sent_ms: None,
            last_received_ms: 0,
            awaiting_echo_since_ms: None,
            starting_over: true,
        }
    }

    /// Forget the exchange after a reconnect
    pub fn reset(&mut self) {
        self.last_sent_ms = None;
        self.awaiting_echo_since_ms = None;
        self.starting_over = true;
    }

    pub fn due(&self, now_ms: i64) -> bool {
        self.last_sent_ms
            .map_or(true, |sent| now_ms - sent >= self.interval_ms)
    }

    /// Next heartbeat to send, with a digit different from the last one
    pub fn next(&mut self, now_ms: i64) -> Heartbeat {
        let mut rng = rand::thread_rng();
        let mut hex = self.my_hex;
        while hex == self.my_hex {
            hex = char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0');
        }
        self.my_hex = hex;
        self.last_sent_ms = Some(now_ms);
        if self.awaiting_echo_since_ms.is_none() {
            self.awaiting_echo_since_ms = Some(now_ms);
        }
        let heartbeat = Heartbeat {
            my_hex: self.my_hex,
            your_last_hex: self.your_last_hex,
            send_time_unix_ms: now_ms,
            last_received_time_unix_ms: self.last_received_ms,
            starting_over: self.starting_over,
        };
        self.starting_over = false;
        heartbeat
    }

    /// Record a peer heartbeat, returns whether it echoed our digit
    pub fn received(&mut self, heartbeat: &Heartbeat, now_ms: i64) -> bool {
        self.your_last_hex = heartbeat.my_hex;
        self.last_received_ms = now_ms;
        let echoed = heartbeat.your_last_hex == self.my_hex;
        if echoed {
            self.awaiting_echo_since_ms = None;
        }
        echoed
    }

    pub fn timed_out(&self, now_ms: i64) -> bool {
        self.awaiting_echo_since_ms
            .is_some_and(|since| now_ms - since >= self.response_timeout_ms)
    }

    /// Restart the echo deadline after a timeout was acted on
    pub fn clear_deadline(&mut self) {
        self.awaiting_echo_since_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(of: &Heartbeat, my_hex: char) -> Heartbeat {
        Heartbeat {
            my_hex,
            your_last_hex: of.my_hex,
            send_time_unix_ms: of.send_time_unix_ms + 5,
            last_received_time_unix_ms: of.send_time_unix_ms,
            starting_over: false,
        }
    }

    #[test]
    fn digits_roll() {
        let mut hb = HeartbeatTracker::new(30, 65);
        let first = hb.next(0);
        assert!(first.starting_over);
        let second = hb.next(30_000);
        assert!(!second.starting_over);
        assert_ne!(first.my_hex, second.my_hex);
        assert!(second.my_hex.is_ascii_hexdigit());
    }

    #[test]
    fn echo_clears_deadline() {
        let mut hb = HeartbeatTracker::new(30, 65);
        let sent = hb.next(1000);
        assert!(!hb.timed_out(60_000));
        assert!(hb.received(&echo(&sent, 'c'), 2000));
        assert!(!hb.timed_out(100_000));
        assert_eq!(hb.next(31_000).your_last_hex, 'c');
    }

    #[test]
    fn missed_echo_times_out() {
        let mut hb = HeartbeatTracker::new(30, 65);
        let sent = hb.next(0);
        hb.next(30_000);
        // stale echo of the first digit does not count
        assert!(!hb.received(&echo(&sent, '1'), 31_000));
        assert!(hb.timed_out(65_000));
        hb.clear_deadline();
        assert!(!hb.timed_out(70_000));
    }

    #[test]
    fn due_after_interval() {
        let mut hb = HeartbeatTracker::new(30, 65);
        assert!(hb.due(0));
        hb.next(0);
        assert!(!hb.due(29_999));
        assert!(hb.due(30_000));
        hb.reset();
        assert!(hb.due(30_001));
    }
}
