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

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::sync::{oneshot, watch};

use crate::telemetry;
use crate::time::{Tick, Timer, TimerFactory};

// Ensure that the `tracing` stack is only initialised once using `once_cell`
static TRACING: Lazy<()> = Lazy::new(telemetry::setup_logging);

pub fn initialize_telemetry() {
    Lazy::force(&TRACING);
}

/// MockTimerFactory hands out timers that only move when the test advances them.
#[derive(Clone, Debug)]
pub struct MockTimerFactory {
    timers: Arc<Mutex<Vec<MockTimer>>>,
    armed: Arc<watch::Sender<usize>>,
}

impl Default for MockTimerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTimerFactory {
    pub fn new() -> Self {
        MockTimerFactory {
            timers: Default::default(),
            armed: Arc::new(watch::channel(0).0),
        }
    }

    /// Number of timers started so far.
    pub fn armed(&self) -> usize {
        *self.armed.borrow()
    }

    /// Waits until at least `n` timers have been started.
    pub async fn wait_armed(&self, n: usize) {
        let mut rx = self.armed.subscribe();
        let _ = rx.wait_for(|armed| *armed >= n).await;
    }

    /// The duration each timer was started with, in order.
    pub fn durations(&self) -> Vec<Duration> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.state().started_with)
            .collect()
    }

    /// The most recently started timer.
    pub fn latest(&self) -> MockTimer {
        self.timers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no timer started")
    }

    /// Moves the clock of the most recently started timer forward, firing it if its deadline
    /// is reached.
    pub fn advance(&self, d: Duration) {
        self.latest().advance(d)
    }
}

impl TimerFactory for MockTimerFactory {
    fn start(&self, d: Duration) -> (Box<dyn Timer>, Tick) {
        let (tx, rx) = oneshot::channel();
        let timer = MockTimer(Arc::new(Mutex::new(MockTimerState {
            started_with: d,
            elapsed: Duration::ZERO,
            deadline: d,
            fire: Some(tx),
            reset_calls: 0,
        })));
        self.timers.lock().unwrap().push(timer.clone());
        self.armed.send_modify(|armed| *armed += 1);
        (Box::new(timer), rx)
    }
}

#[derive(Clone, Debug)]
pub struct MockTimer(Arc<Mutex<MockTimerState>>);

#[derive(Debug)]
struct MockTimerState {
    started_with: Duration,
    // Time since the timer was started or last reset.
    elapsed: Duration,
    deadline: Duration,
    fire: Option<oneshot::Sender<()>>,
    reset_calls: usize,
}

impl MockTimer {
    fn state(&self) -> MutexGuard<'_, MockTimerState> {
        self.0.lock().unwrap()
    }

    pub fn advance(&self, d: Duration) {
        let mut s = self.state();
        if s.fire.is_none() {
            return;
        }
        s.elapsed += d;
        if s.elapsed >= s.deadline {
            if let Some(fire) = s.fire.take() {
                let _ = fire.send(());
            }
        }
    }

    /// Calls to [`Timer::reset`], successful or not.
    pub fn reset_calls(&self) -> usize {
        self.state().reset_calls
    }

    /// Time left before the timer fires, or None if it fired or was stopped.
    pub fn remaining(&self) -> Option<Duration> {
        let s = self.state();
        s.fire.as_ref().map(|_| s.deadline.saturating_sub(s.elapsed))
    }
}

impl Timer for MockTimer {
    fn reset(&self, d: Duration) -> bool {
        let mut s = self.state();
        s.reset_calls += 1;
        if s.fire.is_none() {
            return false;
        }
        s.elapsed = Duration::ZERO;
        s.deadline = d;
        true
    }

    fn stop(&self) -> bool {
        self.state().fire.take().is_some()
    }
}
