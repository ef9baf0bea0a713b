use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use log::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::session::{Connector, ReplicationSession, SessionContext};

/// Each unit of (scaled) velocity shortens the connect interval by a quarter.
const REDUCTION: f64 = 0.75;

/// Connect interval for the given write velocity.
///
/// `base * 0.75^(velocity * multiplier)`, never below `floor` and never
/// above `base`.
pub fn interval_for(velocity: u64, config: &ConnectionConfig, multiplier: f64) -> Duration {
    let base = config.interval;
    let exponent = velocity as f64 * multiplier.max(0.0);
    let scaled = base.as_secs_f64() * REDUCTION.powf(exponent);
    if !scaled.is_finite() || scaled <= config.floor.as_secs_f64() {
        return config.floor.min(base);
    }
    Duration::from_secs_f64(scaled).min(base)
}

/// Chooses which reachable peer the next session dials.
pub trait PeerSelector: Send + Sync {
    fn select(&self, addresses: &[String]) -> Option<String>;
}

/// Uniformly random choice
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl PeerSelector for RandomSelector {
    fn select(&self, addresses: &[String]) -> Option<String> {
        addresses.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Velocity-driven connection loop.
///
/// Two timers share one task: the decay tick, which ages the write
/// velocity and recomputes the connect interval, and the connect timer,
/// which starts a session with one peer whenever velocity is non-zero.
pub struct ConnectionScheduler<C: Connector> {
    ctx: Arc<SessionContext>,
    connector: Arc<C>,
    selector: Arc<dyn PeerSelector>,
    config: ConnectionConfig,
    multiplier: f64,
}

impl<C: Connector> ConnectionScheduler<C> {
    pub fn new(ctx: Arc<SessionContext>, connector: Arc<C>, config: ConnectionConfig, multiplier: f64) -> Self {
        ConnectionScheduler {
            ctx,
            connector,
            selector: Arc::new(RandomSelector),
            config,
            multiplier,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn PeerSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Run until `shutdown` fires, then abort any in-flight sessions.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let velocity = self.ctx.store.velocity().clone();

        let mut tick = interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut current = interval_for(velocity.velocity(), &self.config, self.multiplier);
        let mut connect = interval_at(Instant::now() + current, current);
        connect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sessions: JoinSet<String> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    velocity.lock().tick(self.config.decay_factor);
                    let next = interval_for(velocity.velocity(), &self.config, self.multiplier);
                    if next != current {
                        debug!("Connect interval {:?} -> {:?}", current, next);
                        current = next;
                        connect = interval_at(Instant::now() + current, current);
                        connect.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
                _ = connect.tick() => {
                    self.fire(&mut sessions, &mut in_flight).await;
                }
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    match done {
                        Ok(addr) => {
                            in_flight.remove(&addr);
                        }
                        Err(e) => {
                            warn!("Replication session task failed: {}", e);
                            in_flight.clear();
                        }
                    }
                }
            }
        }

        if !sessions.is_empty() {
            info!("Aborting {} in-flight sessions", sessions.len());
        }
        sessions.abort_all();
    }

    /// One connect-timer expiry: at most one new session, never while idle.
    async fn fire(&self, sessions: &mut JoinSet<String>, in_flight: &mut HashSet<String>) {
        if self.ctx.store.velocity().velocity() == 0 {
            return;
        }

        let addresses = self.ctx.registry.addresses().await;
        let Some(addr) = self.selector.select(&addresses) else {
            return;
        };
        if !in_flight.insert(addr.clone()) {
            debug!("Session with {} still running", addr);
            return;
        }

        let ctx = self.ctx.clone();
        let connector = self.connector.clone();
        sessions.spawn(async move {
            ReplicationSession::new(&ctx, connector.as_ref(), addr.clone())
                .run_reported()
                .await;
            addr
        });
    }
}
