//! Idle keep-alive scheduling

use crate::config::HeartbeatPolicy;
use std::time::Duration;
use tokio::time::Instant;

/// Decides when an idle tunnel should re-send its membership update
#[derive(Debug)]
pub struct Heartbeat {
    policy: HeartbeatPolicy,
    idle_after: Duration,
    last_sent: Option<Instant>,
}

impl Heartbeat {
    pub fn new(policy: HeartbeatPolicy, idle_after: Duration) -> Self {
        Self {
            policy,
            idle_after,
            last_sent: None,
        }
    }

    /// Whether a heartbeat is owed, given the time of the last data packet
    pub fn is_due(&self, now: Instant, last_packet: Instant) -> bool {
        if now.duration_since(last_packet) <= self.idle_after {
            return false;
        }
        match (self.policy, self.last_sent) {
            (HeartbeatPolicy::EveryPoll, _) | (HeartbeatPolicy::RateLimited, None) => true,
            (HeartbeatPolicy::RateLimited, Some(sent)) => {
                now.duration_since(sent) >= self.idle_after
            }
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
    }

    /// Forget the last heartbeat; called on traffic and on a new session
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_not_due_before_idle_threshold() {
        let heartbeat = Heartbeat::new(HeartbeatPolicy::RateLimited, IDLE);
        let last_packet = Instant::now();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!heartbeat.is_due(Instant::now(), last_packet));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(heartbeat.is_due(Instant::now(), last_packet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_fires_once_per_period() {
        let mut heartbeat = Heartbeat::new(HeartbeatPolicy::RateLimited, IDLE);
        let last_packet = Instant::now();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(heartbeat.is_due(Instant::now(), last_packet));
        heartbeat.mark_sent(Instant::now());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!heartbeat.is_due(Instant::now(), last_packet));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(heartbeat.is_due(Instant::now(), last_packet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_poll_fires_each_iteration() {
        let mut heartbeat = Heartbeat::new(HeartbeatPolicy::EveryPoll, IDLE);
        let last_packet = Instant::now();

        tokio::time::advance(Duration::from_secs(31)).await;
        heartbeat.mark_sent(Instant::now());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(heartbeat.is_due(Instant::now(), last_packet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_allows_immediate_heartbeat() {
        let mut heartbeat = Heartbeat::new(HeartbeatPolicy::RateLimited, IDLE);
        let last_packet = Instant::now();

        tokio::time::advance(Duration::from_secs(31)).await;
        heartbeat.mark_sent(Instant::now());
        heartbeat.reset();
        assert!(heartbeat.is_due(Instant::now(), last_packet));
    }
}
