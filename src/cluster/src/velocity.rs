use std::sync::{Arc, Mutex, MutexGuard};

/// Decaying counter of recent write volume.
///
/// Velocity rises by the number of ops in every committed batch and decays
/// by one step once it has stayed flat for `velocity * decay_factor` ticks,
/// so a burst of writes fades out gradually once writes stop.
///
/// Velocity can also be *borrowed*: an idle node that hears from an active
/// peer wakes up with velocity 1 so it pulls the peer's new data, but
/// borrowed velocity is not advertised onward.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteVelocity {
    velocity: u64,
    last_velocity: u64,
    ticks: u64,
    borrowed: u64,
}

impl WriteVelocity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `ops` committed mutations
    pub fn record(&mut self, ops: u64) {
        if ops == 0 {
            return;
        }
        self.velocity = self.velocity.saturating_add(ops);
        self.borrowed = 0;
    }

    /// Wake an idle node. Returns true if the node was idle.
    pub fn wake(&mut self) -> bool {
        if self.velocity > 0 {
            return false;
        }
        self.velocity = 1;
        self.borrowed = 1;
        self.ticks = 0;
        true
    }

    /// Advance the decay clock by one tick
    pub fn tick(&mut self, decay_factor: u64) {
        if self.velocity > 0 && self.velocity <= self.last_velocity {
            self.ticks += 1;
            if self.ticks >= self.velocity.saturating_mul(decay_factor.max(1)) {
                self.ticks = 0;
                self.velocity -= 1;
                self.borrowed = self.borrowed.min(self.velocity);
            }
        } else {
            self.ticks = 0;
        }
        self.last_velocity = self.velocity;
    }

    pub fn velocity(&self) -> u64 {
        self.velocity
    }

    /// Velocity that came from real mutations rather than a wake-up
    pub fn earned(&self) -> u64 {
        self.velocity - self.borrowed
    }

    pub fn is_idle(&self) -> bool {
        self.velocity == 0
    }
}

/// Velocity shared between the write path and the scheduler
#[derive(Debug, Clone, Default)]
pub struct SharedVelocity(Arc<Mutex<WriteVelocity>>);

impl SharedVelocity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, WriteVelocity> {
        // the counter stays consistent even if a holder panicked
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, ops: u64) {
        self.lock().record(ops);
    }

    pub fn wake(&self) -> bool {
        self.lock().wake()
    }

    pub fn velocity(&self) -> u64 {
        self.lock().velocity()
    }

    pub fn earned(&self) -> u64 {
        self.lock().earned()
    }
}
