//! The idle reaper: periodic eviction of dead and abandoned connections.
//!
//! Browser tabs vanish, laptops sleep, NAT mappings expire. The reaper is
//! the single mechanism that reclaims the sessions those leave behind.
//! Anonymous connections get a short grace period to authenticate;
//! authenticated ones are held to the session timeout.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use trellis_protocol::envelope::timestamp_millis;

use crate::registry::SessionRegistry;

/// Timing knobs for the reaper. Defaults mirror a ten-second sweep with a
/// ten-minute session timeout and a thirty-second anonymous grace period.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Cadence between sweeps.
    pub sweep_interval: Duration,
    /// Idle bound for any session, authenticated or not.
    pub authenticated_timeout: Duration,
    /// Idle bound for sessions that never authenticated.
    pub anonymous_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10),
            authenticated_timeout: Duration::from_secs(600),
            anonymous_timeout: Duration::from_secs(30),
        }
    }
}

/// Sweeps the registry for idle sessions and closes them.
pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    config: ReaperConfig,
    on_reaped: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

impl IdleReaper {
    /// Create a reaper over `registry`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: ReaperConfig) -> Self {
        Self {
            registry,
            config,
            on_reaped: None,
        }
    }

    /// Observe each sweep that reaped at least one session. The server uses
    /// this to feed its counters; the reaper itself stays metrics-free.
    #[must_use]
    pub fn with_observer(mut self, observer: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_reaped = Some(Box::new(observer));
        self
    }

    /// Run sweeps forever. The first sweep is aligned to the next minute
    /// boundary so eviction timing reads cleanly in the logs, then the
    /// configured cadence takes over.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Self::alignment_delay()).await;
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One pass over the registry. Returns the ids of sessions reaped, which
    /// also makes the policy directly testable.
    pub async fn sweep_once(&self) -> Vec<String> {
        let now = timestamp_millis();
        let session_limit = millis(self.config.authenticated_timeout);
        let anonymous_limit = millis(self.config.anonymous_timeout);

        let mut reaped = Vec::new();
        for session in self.registry.snapshot() {
            let idle = session.idle_millis(now);
            let authenticated = session.user().is_some();

            let expired = idle > session_limit;
            let abandoned = !authenticated && idle > anonymous_limit;
            if !(expired || abandoned) {
                continue;
            }

            tracing::info!(
                session = %session.id(),
                idle_ms = idle,
                authenticated,
                "reaping idle session"
            );
            self.registry.close_session(session.id()).await;
            reaped.push(session.id().to_string());
        }

        if !reaped.is_empty() {
            if let Some(observer) = &self.on_reaped {
                observer(reaped.len());
            }
        }
        reaped
    }

    /// Time until the next wall-clock minute boundary.
    fn alignment_delay() -> Duration {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Duration::from_secs(60 - (now_secs % 60))
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CaptureSink;

    fn config(session_secs: u64, anonymous_secs: u64) -> ReaperConfig {
        ReaperConfig {
            sweep_interval: Duration::from_secs(10),
            authenticated_timeout: Duration::from_secs(session_secs),
            anonymous_timeout: Duration::from_secs(anonymous_secs),
        }
    }

    #[tokio::test]
    async fn test_active_sessions_survive_a_sweep() {
        let registry = Arc::new(SessionRegistry::default());
        registry.create("localhost", "127.0.0.1:1", CaptureSink::new().boxed());

        let reaper = IdleReaper::new(Arc::clone(&registry), ReaperConfig::default());
        let reaped = reaper.sweep_once().await;

        assert!(reaped.is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_anonymous_session_gets_shorter_grace() {
        let registry = Arc::new(SessionRegistry::default());
        let anon_capture = CaptureSink::new();
        let anon = registry.create("localhost", "127.0.0.1:1", anon_capture.boxed());
        let authed = registry.create("localhost", "127.0.0.1:2", CaptureSink::new().boxed());
        authed.bind_principal("user1", false, "tok");

        // Both idle for one minute: past the anonymous bound, inside the
        // authenticated one.
        let one_minute_ago = timestamp_millis() - 60_000;
        anon.set_last_activity_millis(one_minute_ago);
        authed.set_last_activity_millis(one_minute_ago);

        let reaper = IdleReaper::new(Arc::clone(&registry), config(600, 30));
        let reaped = reaper.sweep_once().await;

        assert_eq!(reaped, vec![anon.id().to_string()]);
        assert!(anon_capture.closed());
        assert!(registry.get(authed.id()).is_some());
    }

    #[tokio::test]
    async fn test_authenticated_session_expires_past_session_timeout() {
        let registry = Arc::new(SessionRegistry::default());
        let capture = CaptureSink::new();
        let session = registry.create("localhost", "127.0.0.1:1", capture.boxed());
        session.bind_principal("user1", false, "tok");
        session.set_last_activity_millis(timestamp_millis() - 601_000);

        let reaper = IdleReaper::new(Arc::clone(&registry), config(600, 30));
        let reaped = reaper.sweep_once().await;

        assert_eq!(reaped.len(), 1);
        assert!(capture.closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_reaped_count() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let registry = Arc::new(SessionRegistry::default());
        for port in 1..=2 {
            let session =
                registry.create("localhost", format!("127.0.0.1:{port}"), CaptureSink::new().boxed());
            session.set_last_activity_millis(timestamp_millis() - 60_000);
        }

        let observed = Arc::new(AtomicUsize::new(0));
        let observed_in_hook = Arc::clone(&observed);
        let reaper = IdleReaper::new(Arc::clone(&registry), config(600, 30))
            .with_observer(move |n| {
                observed_in_hook.fetch_add(n, Ordering::Relaxed);
            });

        reaper.sweep_once().await;
        assert_eq!(observed.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_touch_resets_the_idle_clock() {
        let registry = Arc::new(SessionRegistry::default());
        let session = registry.create("localhost", "127.0.0.1:1", CaptureSink::new().boxed());
        session.set_last_activity_millis(timestamp_millis() - 60_000);
        session.touch();

        let reaper = IdleReaper::new(Arc::clone(&registry), config(600, 30));
        assert!(reaper.sweep_once().await.is_empty());
    }
}
