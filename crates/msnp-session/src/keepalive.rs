//! Keep-alive probing for the notification channel.
//!
//! The client sends `PNG`; the server answers `QNG <seconds>` naming the
//! delay before the next probe is due. A probe left unanswered for one full
//! interval means the connection is dead.

use std::time::Duration;

use tokio::time::Instant;

/// What the channel has to do when the keep-alive deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Send a probe now.
    Probe,
    /// The last probe went unanswered; the connection is gone.
    Expired,
}

#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    next_probe: Instant,
    /// Deadline for the outstanding probe's answer.
    awaiting: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_probe: now + interval,
            awaiting: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting.is_some()
    }

    /// When [`poll`](Self::poll) next has something to do.
    pub fn deadline(&self) -> Instant {
        self.awaiting.unwrap_or(self.next_probe)
    }

    pub fn poll(&mut self, now: Instant) -> Option<KeepAliveAction> {
        if let Some(deadline) = self.awaiting {
            return (now >= deadline).then_some(KeepAliveAction::Expired);
        }
        if now >= self.next_probe {
            self.awaiting = Some(now + self.interval);
            return Some(KeepAliveAction::Probe);
        }
        None
    }

    /// A `QNG` arrived, optionally carrying a new interval.
    pub fn acknowledged(&mut self, now: Instant, interval: Option<Duration>) {
        if let Some(interval) = interval.filter(|i| !i.is_zero()) {
            self.interval = interval;
        }
        self.awaiting = None;
        self.next_probe = now + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_then_ack() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(Duration::from_secs(50), start);
        assert_eq!(ka.poll(start + Duration::from_secs(10)), None);

        let t = start + Duration::from_secs(50);
        assert_eq!(ka.poll(t), Some(KeepAliveAction::Probe));
        assert!(ka.is_awaiting_ack());
        assert_eq!(ka.poll(t + Duration::from_secs(1)), None);

        ka.acknowledged(t + Duration::from_secs(1), Some(Duration::from_secs(40)));
        assert_eq!(ka.deadline(), t + Duration::from_secs(41));
    }

    #[test]
    fn test_unanswered_probe_expires_after_one_interval() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(Duration::from_secs(50), start);
        let t = start + Duration::from_secs(50);
        assert_eq!(ka.poll(t), Some(KeepAliveAction::Probe));
        assert_eq!(ka.deadline(), t + Duration::from_secs(50));
        assert_eq!(ka.poll(t + Duration::from_secs(49)), None);
        assert_eq!(ka.poll(t + Duration::from_secs(50)), Some(KeepAliveAction::Expired));
    }

    #[test]
    fn test_zero_interval_ignored() {
        let start = Instant::now();
        let mut ka = KeepAlive::new(Duration::from_secs(50), start);
        ka.acknowledged(start, Some(Duration::ZERO));
        assert_eq!(ka.interval(), Duration::from_secs(50));
    }
}
