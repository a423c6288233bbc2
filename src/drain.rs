// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::classify::Classifier;
use crate::config::DrainerConfig;
use crate::time::{Tick, Timer, TimerFactory, TokioTimerFactory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainState {
    NotDraining,
    /// Health probes are failing and we are waiting for traffic to go quiet.
    Draining,
    /// The quiet period elapsed. Stays here until [`Drainer::reset`].
    Drained,
}

/// How a call to [`Drainer::drain`] was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The quiet period elapsed without ordinary traffic.
    Drained,
    /// [`Drainer::reset`] was called first. Traffic may still be arriving.
    Aborted,
}

/// Drainer tracks graceful shutdown of an HTTP server.
///
/// Once [`Drainer::drain`] is called, health probes fail so the orchestrator stops routing
/// to us, while ordinary requests keep being served and push the end of the drain back by
/// a full quiet period. The drain completes once a quiet period passes with no ordinary
/// traffic.
///
/// Drainer is a cheap handle; clones share state. It is wired into a request path with
/// [`crate::DrainLayer`].
#[derive(Clone)]
pub struct Drainer {
    inner: Arc<Inner>,
}

struct Inner {
    quiet_period: Duration,
    classifier: Classifier,
    timers: Arc<dyn TimerFactory>,
    machine: RwLock<Machine>,
}

struct Machine {
    // Bumped each time a drain cycle starts, so ticks from an earlier cycle can be told apart.
    generation: u64,
    state: State,
}

enum State {
    NotDraining,
    Draining(Cycle),
    Drained,
}

struct Cycle {
    timer: Box<dyn Timer>,
    done: watch::Sender<Option<DrainOutcome>>,
}

impl Drainer {
    pub fn new(cfg: DrainerConfig) -> Self {
        Self::with_timer_factory(cfg, Arc::new(TokioTimerFactory))
    }

    pub fn with_timer_factory(cfg: DrainerConfig, timers: Arc<dyn TimerFactory>) -> Self {
        Drainer {
            inner: Arc::new(Inner {
                quiet_period: cfg.quiet_period(),
                classifier: Classifier::new(cfg.health_check_user_agents),
                timers,
                machine: RwLock::new(Machine {
                    generation: 0,
                    state: State::NotDraining,
                }),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet_period
    }

    pub fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    pub fn state(&self) -> DrainState {
        match self.inner.read().state {
            State::NotDraining => DrainState::NotDraining,
            State::Draining(_) => DrainState::Draining,
            State::Drained => DrainState::Drained,
        }
    }

    /// True once a drain has started, until the next reset. Health probes fail while this
    /// holds.
    pub fn is_draining(&self) -> bool {
        self.state() != DrainState::NotDraining
    }

    /// Number of callers currently waiting in [`Drainer::drain`].
    pub fn waiters(&self) -> usize {
        match &self.inner.read().state {
            State::Draining(cycle) => cycle.done.receiver_count(),
            State::NotDraining | State::Drained => 0,
        }
    }

    /// Starts a drain, or joins the one in progress, and waits for it to end.
    ///
    /// Returns immediately if a previous drain already completed. Otherwise the caller
    /// is released, together with every other caller waiting on the same drain, when
    /// either the quiet period elapses with no ordinary traffic or [`Drainer::reset`] is
    /// called. There is no timeout; callers wanting one should race this future against
    /// their own deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn drain(&self) -> DrainOutcome {
        let mut done = {
            let mut guard = self.inner.write();
            let m = &mut *guard;
            match m.state {
                State::Drained => return DrainOutcome::Drained,
                State::Draining(ref cycle) => cycle.done.subscribe(),
                State::NotDraining => self.arm(m),
            }
        };
        // A closed channel means the cycle was torn down without an outcome; treat it like a reset.
        let outcome = match done.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => None,
        };
        outcome.unwrap_or(DrainOutcome::Aborted)
    }

    fn arm(&self, m: &mut Machine) -> watch::Receiver<Option<DrainOutcome>> {
        m.generation += 1;
        let generation = m.generation;
        let (timer, tick) = self.inner.timers.start(self.inner.quiet_period);
        let (done, rx) = watch::channel(None);
        m.state = State::Draining(Cycle { timer, done });
        tokio::spawn(wait_for_tick(Arc::downgrade(&self.inner), generation, tick));
        info!(
            quiet_period = ?self.inner.quiet_period,
            "drain started, failing health probes"
        );
        rx
    }

    /// Aborts a drain in progress, releasing everyone waiting on it with
    /// [`DrainOutcome::Aborted`] before returning. After a completed drain, returns to
    /// [`DrainState::NotDraining`] so a later drain waits a full quiet period again.
    pub fn reset(&self) {
        let mut m = self.inner.write();
        match std::mem::replace(&mut m.state, State::NotDraining) {
            State::Draining(cycle) => {
                cycle.timer.stop();
                cycle.done.send_replace(Some(DrainOutcome::Aborted));
                info!("drain aborted");
            }
            State::Drained => debug!("drainer reset after completed drain"),
            State::NotDraining => {}
        }
    }

    /// Called for every ordinary request. While draining, the quiet period restarts.
    pub fn on_request(&self) {
        let m = self.inner.read();
        if let State::Draining(cycle) = &m.state {
            if cycle.timer.reset(self.inner.quiet_period) {
                trace!("request received while draining, quiet period restarted");
            } else {
                // The timer fired but its tick has not been processed yet; this request
                // slips through and the drain still completes.
                debug!("request received as drain timer fired");
            }
        }
    }
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Machine> {
        self.machine.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Machine> {
        self.machine.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_tick(&self, generation: u64) {
        let mut guard = self.write();
        let m = &mut *guard;
        match std::mem::replace(&mut m.state, State::Drained) {
            State::Draining(cycle) if m.generation == generation => {
                cycle.done.send_replace(Some(DrainOutcome::Drained));
                info!(waiters = cycle.done.receiver_count(), "drain complete");
            }
            other => {
                m.state = other;
                debug!(generation, "ignoring drain timer from an earlier cycle");
            }
        }
    }
}

async fn wait_for_tick(inner: Weak<Inner>, generation: u64, tick: Tick) {
    // An error means the timer was stopped by a reset.
    if tick.await.is_err() {
        return;
    }
    if let Some(inner) = inner.upgrade() {
        inner.on_tick(generation);
    }
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer")
            .field("quiet_period", &self.inner.quiet_period)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
