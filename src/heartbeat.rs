//! Heartbeat supervisor
//!
//! Owned by a connection task. Once started it asks for a PING every
//! interval and reports a timeout when no PONG arrives before the deadline.

use std::future;
use std::time::Duration;

use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// Default time between two PINGs
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default time a client has to answer a PING
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(3);

/// Heartbeat settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_PING_INTERVAL,
            timeout: DEFAULT_PONG_TIMEOUT,
        }
    }
}

/// What the connection has to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a PING; the deadline is armed
    SendPing,
    /// The deadline passed without a PONG
    TimedOut,
}

/// Result of handing a PONG to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PongOutcome {
    /// Answered an outstanding PING; the deadline is cancelled
    Accepted,
    /// No PING was outstanding
    Unsolicited,
}

/// Per-connection ping/pong state
///
/// The deadline is a plain value: cancelling it clears the value, and the
/// timer future is rebuilt from it on every poll, so a cancelled deadline
/// can never fire.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    ticker: Option<Interval>,
    deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            ticker: None,
            deadline: None,
        }
    }

    /// Start pinging
    ///
    /// Returns false when heartbeats are disabled or already running.
    pub fn start(&mut self) -> bool {
        if !self.config.enabled || self.ticker.is_some() {
            return false;
        }

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        true
    }

    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// True while a PING is outstanding
    pub fn awaiting_pong(&self) -> bool {
        self.deadline.is_some()
    }

    /// Record a PONG from the client
    pub fn on_pong(&mut self) -> PongOutcome {
        match self.deadline.take() {
            Some(_) => PongOutcome::Accepted,
            None => PongOutcome::Unsolicited,
        }
    }

    /// Cancel the interval and any armed deadline
    pub fn stop(&mut self) {
        self.ticker = None;
        self.deadline = None;
    }

    /// Wait for the next heartbeat event
    ///
    /// Never resolves while stopped. Cancel safe, so it can sit in a
    /// `tokio::select!` next to socket reads.
    pub async fn next_event(&mut self) -> HeartbeatEvent {
        let Some(ticker) = self.ticker.as_mut() else {
            return future::pending().await;
        };
        let deadline = self.deadline;

        tokio::select! {
            biased;

            _ = expire(deadline) => {
                self.deadline = None;
                HeartbeatEvent::TimedOut
            }
            _ = ticker.tick() => {
                // An unanswered earlier PING keeps its deadline
                self.deadline.get_or_insert(Instant::now() + self.config.timeout);
                HeartbeatEvent::SendPing
            }
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_timeout() {
        let mut heartbeat = Heartbeat::new(config());
        assert!(heartbeat.start());
        let started = Instant::now();

        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
        assert!(heartbeat.awaiting_pong());

        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(13));
        assert!(started.elapsed() < Duration::from_secs(14));
        assert!(!heartbeat.awaiting_pong());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_cancels_deadline() {
        let mut heartbeat = Heartbeat::new(config());
        heartbeat.start();
        let started = Instant::now();

        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(heartbeat.on_pong(), PongOutcome::Accepted);
        assert!(!heartbeat.awaiting_pong());

        // Next event is the following PING, not a timeout
        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(started.elapsed() < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_longer_than_interval() {
        let mut heartbeat = Heartbeat::new(HeartbeatConfig {
            enabled: true,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(15),
        });
        heartbeat.start();
        let started = Instant::now();

        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);
        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);
        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(25));
        assert!(started.elapsed() < Duration::from_secs(26));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_pong() {
        let mut heartbeat = Heartbeat::new(config());
        assert_eq!(heartbeat.on_pong(), PongOutcome::Unsolicited);

        heartbeat.start();
        assert_eq!(heartbeat.on_pong(), PongOutcome::Unsolicited);

        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);
        assert_eq!(heartbeat.on_pong(), PongOutcome::Accepted);
        assert_eq!(heartbeat.on_pong(), PongOutcome::Unsolicited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_fires() {
        let mut heartbeat = Heartbeat::new(HeartbeatConfig {
            enabled: false,
            ..config()
        });
        assert!(!heartbeat.start());
        assert!(!heartbeat.is_running());

        let waited = tokio::time::timeout(Duration::from_secs(60), heartbeat.next_event()).await;
        assert!(waited.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice() {
        let mut heartbeat = Heartbeat::new(config());
        assert!(heartbeat.start());
        assert!(!heartbeat.start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_armed_deadline() {
        let mut heartbeat = Heartbeat::new(config());
        heartbeat.start();
        assert_eq!(heartbeat.next_event().await, HeartbeatEvent::SendPing);

        heartbeat.stop();
        assert!(!heartbeat.awaiting_pong());
        assert!(!heartbeat.is_running());

        let waited = tokio::time::timeout(Duration::from_secs(60), heartbeat.next_event()).await;
        assert!(waited.is_err());
    }
}
