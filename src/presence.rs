//! Online/offline duty cycle for one account.
//!
//! Each cycle goes online for `online_secs` scaled by a uniform jitter, then
//! offline for exactly `offline_secs`. Dwell time is slept in ticks of at
//! most one second so a stop request is seen within one tick.

use crate::provider::SharedConnection;
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use ubcore::AccountKey;

const MAX_TICK_MS: u64 = 1000;
const MIN_DWELL: Duration = Duration::from_secs(1);
/// Longest configurable phase, one week.
const MAX_DWELL_SECS: u64 = 7 * 24 * 3600;
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub online_secs: u64,
    pub offline_secs: u64,
    /// Fraction of `online_secs` the online phase may deviate by, either way.
    pub jitter: f64,
    pub tick_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_secs: 300,
            offline_secs: 60,
            jitter: 0.2,
            tick_ms: MAX_TICK_MS,
        }
    }
}

impl PresenceConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.clamp(1, MAX_TICK_MS))
    }

    pub fn jitter_fraction(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 0.9)
        } else {
            0.0
        }
    }

    /// Online dwell for a jitter sample in `[-1, 1]`.
    pub fn online_dwell(&self, sample: f64) -> Duration {
        let factor = 1.0 + self.jitter_fraction() * sample.clamp(-1.0, 1.0);
        let online = self.online_secs.min(MAX_DWELL_SECS) as f64;
        Duration::from_secs_f64(online * factor).max(MIN_DWELL)
    }

    pub fn offline_dwell(&self) -> Duration {
        Duration::from_secs(self.offline_secs.min(MAX_DWELL_SECS)).max(MIN_DWELL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Online,
    Offline,
}

impl Phase {
    fn is_online(self) -> bool {
        self == Phase::Online
    }

    fn as_str(self) -> &'static str {
        match self {
            Phase::Online => "online",
            Phase::Offline => "offline",
        }
    }
}

pub struct PresenceScheduler {
    account: AccountKey,
    connection: Arc<SharedConnection>,
    config: PresenceConfig,
    cancel: watch::Receiver<bool>,
}

impl PresenceScheduler {
    pub fn new(
        account: AccountKey,
        connection: Arc<SharedConnection>,
        config: PresenceConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            account,
            connection,
            config,
            cancel,
        }
    }

    /// Runs until cancelled. No status is written on the way out.
    pub async fn run(mut self) {
        let mut cycle: u64 = 0;
        info!(target: "Session/Presence", "[{}] Presence loop started", self.account);

        loop {
            if self.is_cancelled() {
                break;
            }
            cycle += 1;

            let online = self
                .config
                .online_dwell(rand::rng().random_range(-1.0..=1.0));
            if !self.phase(Phase::Online, online, cycle).await {
                break;
            }
            let offline = self.config.offline_dwell();
            if !self.phase(Phase::Offline, offline, cycle).await {
                break;
            }
        }

        info!(target: "Session/Presence", "[{}] Presence loop stopped after {cycle} cycles", self.account);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Writes the phase's status, then dwells in it. Returns `false` when
    /// cancelled.
    async fn phase(&mut self, phase: Phase, dwell: Duration, cycle: u64) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if let Err(e) = self.connection.set_presence(phase.is_online()).await {
            warn!(
                target: "Session/Presence",
                "[{}] Failed to go {}: {e}",
                self.account,
                phase.as_str()
            );
        }
        info!(
            target: "Session/Presence",
            "[{}] Cycle {cycle}: {} for {}s",
            self.account,
            phase.as_str(),
            dwell.as_secs()
        );
        self.dwell(phase, dwell, cycle).await
    }

    async fn dwell(&mut self, phase: Phase, total: Duration, cycle: u64) -> bool {
        let tick = self.config.tick();
        let started = Instant::now();
        let deadline = started + total;
        let mut next_report = started + REPORT_INTERVAL;

        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let remaining = deadline - now;
            if now >= next_report {
                next_report += REPORT_INTERVAL;
                if phase.is_online() {
                    info!(
                        target: "Session/Presence",
                        "[{}] Cycle {cycle}: {}m {}s online left",
                        self.account,
                        remaining.as_secs() / 60,
                        remaining.as_secs() % 60
                    );
                } else {
                    debug!(
                        target: "Session/Presence",
                        "[{}] Cycle {cycle}: {}s offline left",
                        self.account,
                        remaining.as_secs()
                    );
                }
            }

            tokio::select! {
                _ = sleep(remaining.min(tick)) => {}
                changed = self.cancel.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ConnectionFactory;
    use crate::provider::loopback::{LoopbackAccount, LoopbackProvider};
    use ubcore::AppCredentials;

    async fn authorized_connection() -> (LoopbackProvider, AccountKey, Arc<SharedConnection>) {
        let provider = LoopbackProvider::new();
        provider.register(LoopbackAccount::new("+15550000000", "12345", "Alice"));
        let key = AccountKey::from_phone("+15550000000");
        provider.seed_session("15550000000", &key);
        let conn = provider
            .open(&AppCredentials::new(1, "secret"), "15550000000")
            .await
            .unwrap();
        conn.connect().await.unwrap();
        (provider, key, Arc::new(SharedConnection::new(conn)))
    }

    #[test]
    fn jitter_only_scales_the_online_phase() {
        let config = PresenceConfig::default();
        assert_eq!(config.online_dwell(-1.0), Duration::from_secs(240));
        assert_eq!(config.online_dwell(1.0), Duration::from_secs(360));
        assert_eq!(config.online_dwell(0.0), Duration::from_secs(300));
        assert_eq!(config.offline_dwell(), Duration::from_secs(60));
    }

    #[test]
    fn tick_is_clamped_to_one_second() {
        let config = PresenceConfig {
            tick_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(config.tick(), Duration::from_secs(1));
    }

    #[test]
    fn huge_phases_are_capped_at_a_week() {
        let config = PresenceConfig {
            online_secs: u64::MAX,
            offline_secs: u64::MAX,
            jitter: 0.0,
            ..Default::default()
        };
        let week = Duration::from_secs(MAX_DWELL_SECS);
        assert_eq!(config.online_dwell(1.0), week);
        assert_eq!(config.offline_dwell(), week);
    }

    #[tokio::test(start_paused = true)]
    async fn alternates_online_and_offline() {
        let (provider, key, connection) = authorized_connection().await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let scheduler =
            PresenceScheduler::new(key.clone(), connection, PresenceConfig::default(), cancel_rx);
        let task = tokio::spawn(scheduler.run());

        sleep(Duration::from_secs(1_000)).await;
        let changes = provider.presence_changes(&key);
        assert!(changes.len() >= 4, "only {} presence writes", changes.len());
        for (i, change) in changes.iter().enumerate() {
            assert_eq!(change.online, i % 2 == 0);
        }
        for pair in changes.windows(2) {
            let dwell = (pair[1].at - pair[0].at).as_secs_f64();
            if pair[0].online {
                assert!((239.9..=360.1).contains(&dwell), "online dwell {dwell}");
            } else {
                assert!((59.9..=60.1).contains(&dwell), "offline dwell {dwell}");
            }
        }

        cancel_tx.send_replace(true);
        task.await.unwrap();
        let written = provider.presence_changes(&key).len();
        sleep(Duration::from_secs(600)).await;
        assert_eq!(provider.presence_changes(&key).len(), written);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_seen_within_a_tick() {
        let (_provider, key, connection) = authorized_connection().await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(
            PresenceScheduler::new(key, connection, PresenceConfig::default(), cancel_rx).run(),
        );

        sleep(Duration::from_secs(30)).await;
        let requested = Instant::now();
        cancel_tx.send_replace(true);
        task.await.unwrap();
        assert!(Instant::now() - requested <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_writes_do_not_stop_the_loop() {
        let (provider, key, connection) = authorized_connection().await;
        provider.fail_presence(true);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(
            PresenceScheduler::new(key.clone(), connection, PresenceConfig::default(), cancel_rx)
                .run(),
        );

        sleep(Duration::from_secs(900)).await;
        assert!(provider.presence_changes(&key).is_empty());
        assert!(!task.is_finished());

        provider.fail_presence(false);
        sleep(Duration::from_secs(900)).await;
        assert!(!provider.presence_changes(&key).is_empty());

        cancel_tx.send_replace(true);
        task.await.unwrap();
    }
}
