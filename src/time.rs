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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::trace;

// Deadlines past this are clamped; such a timer never fires in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `d` from now. Durations too large to represent are clamped to a far-future
/// deadline instead of overflowing.
pub fn deadline_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Tick resolves with `Ok(())` when the timer it was issued with fires. If the timer is stopped
/// (or dropped) before firing, the sender is dropped and the receiver resolves with an error.
pub type Tick = oneshot::Receiver<()>;

/// A one-shot countdown that can be pushed back or cancelled before it fires.
pub trait Timer: Send + Sync {
    /// Reschedules a pending timer to fire `d` from now.
    /// Returns false, without rescheduling, if the timer already fired or was stopped.
    fn reset(&self, d: Duration) -> bool;

    /// Prevents a pending timer from firing.
    /// Returns false if the timer already fired or was stopped.
    fn stop(&self) -> bool;
}

/// TimerFactory creates timers. The drainer takes one at construction so tests can
/// substitute a timer they control.
pub trait TimerFactory: Send + Sync {
    fn start(&self, d: Duration) -> (Box<dyn Timer>, Tick);
}

/// Timers backed by the tokio clock. Must be used from within a tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimerFactory;

impl TimerFactory for TokioTimerFactory {
    fn start(&self, d: Duration) -> (Box<dyn Timer>, Tick) {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Pending(deadline_after(d))),
            wake: Notify::new(),
        });
        tokio::spawn(run(shared.clone(), tx));
        (Box::new(TokioTimer { shared }), rx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Pending(Instant),
    Fired,
    Stopped,
}

#[derive(Debug)]
struct Shared {
    phase: Mutex<Phase>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct TokioTimer {
    shared: Arc<Shared>,
}

impl Timer for TokioTimer {
    fn reset(&self, d: Duration) -> bool {
        let mut phase = self.shared.lock();
        if !matches!(*phase, Phase::Pending(_)) {
            return false;
        }
        *phase = Phase::Pending(deadline_after(d));
        // The deadline may have moved earlier, so the sleeping task must re-read it.
        self.shared.wake.notify_one();
        true
    }

    fn stop(&self) -> bool {
        let mut phase = self.shared.lock();
        if !matches!(*phase, Phase::Pending(_)) {
            return false;
        }
        *phase = Phase::Stopped;
        self.shared.wake.notify_one();
        true
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(shared: Arc<Shared>, tick: oneshot::Sender<()>) {
    loop {
        let deadline = match *shared.lock() {
            Phase::Pending(deadline) => deadline,
            Phase::Fired | Phase::Stopped => return,
        };
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = shared.wake.notified() => continue,
        }
        {
            // The deadline is re-checked under the lock; a reset that landed while we slept wins.
            let mut phase = shared.lock();
            match *phase {
                Phase::Pending(deadline) if deadline > Instant::now() => continue,
                Phase::Pending(_) => {}
                Phase::Fired | Phase::Stopped => return,
            }
            *phase = Phase::Fired;
        }
        trace!("timer fired");
        let _ = tick.send(());
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let start = Instant::now();
        let (_timer, tick) = TokioTimerFactory.start(PERIOD);
        tick.await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= PERIOD, "fired early: {elapsed:?}");
        assert!(elapsed < PERIOD + Duration::from_millis(5), "fired late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_pushes_deadline_back() {
        let start = Instant::now();
        let (timer, tick) = TokioTimerFactory.start(PERIOD);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(timer.reset(PERIOD));
        tick.await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(160), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(165), "fired late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_can_shorten_deadline() {
        let start = Instant::now();
        let (timer, tick) = TokioTimerFactory.start(Duration::from_secs(10));
        assert!(timer.reset(PERIOD));
        tick.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_firing() {
        let (timer, tick) = TokioTimerFactory.start(PERIOD);
        assert!(timer.stop());
        assert!(!timer.stop());
        assert!(!timer.reset(PERIOD));
        assert!(tick.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_fire_is_rejected() {
        let (timer, tick) = TokioTimerFactory.start(PERIOD);
        tick.await.unwrap();
        assert!(!timer.reset(PERIOD));
        assert!(!timer.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_duration_does_not_overflow() {
        let (timer, tick) = TokioTimerFactory.start(Duration::MAX);
        let mut tick = Box::pin(tick);
        assert!(
            tokio::time::timeout(Duration::from_secs(3600), &mut tick)
                .await
                .is_err()
        );
        assert!(timer.reset(Duration::MAX));

        // Shortening the deadline still works afterwards.
        let start = Instant::now();
        assert!(timer.reset(PERIOD));
        tick.await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn deadline_after_clamps() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let now = Instant::now();
            assert_eq!(deadline_after(PERIOD), now + PERIOD);
            assert_eq!(deadline_after(Duration::MAX), now + FAR_FUTURE);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_timer_stops_it() {
        let (timer, tick) = TokioTimerFactory.start(PERIOD);
        drop(timer);
        assert!(tick.await.is_err());
    }
}
