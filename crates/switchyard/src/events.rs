//! Waitable record of the Initialized, Started and Exited transitions.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use strum::Display;

use crate::error::HubError;
use crate::hub::Hub;
use crate::listener::LifecycleListener;
use crate::provider::ProviderError;

/// Lifecycle transitions observable through [`HubEvents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    /// Every instance finished Init.
    Initialized,
    /// Every runnable instance was launched.
    Started,
    /// The hub is about to exit.
    Exited,
}

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The stage was reached; for [`Stage::Exited`], without an error.
    Completed,
    /// The hub exited with this error before or while reaching the stage.
    Failed(String),
    /// The hub exited cleanly without reaching the stage.
    Skipped,
}

#[derive(Debug, Default)]
struct Slots {
    initialized: Option<StageOutcome>,
    started: Option<StageOutcome>,
    exited: Option<StageOutcome>,
}

impl Slots {
    const fn slot(&mut self, stage: Stage) -> &mut Option<StageOutcome> {
        match stage {
            Stage::Initialized => &mut self.initialized,
            Stage::Started => &mut self.started,
            Stage::Exited => &mut self.exited,
        }
    }
}

/// Clonable handle reporting when the hub passes each [`Stage`].
///
/// Every stage resolves exactly once. When the hub exits early, stages it
/// never reached resolve with the exit error, or [`StageOutcome::Skipped`]
/// when it exited cleanly.
#[derive(Debug, Clone, Default)]
pub struct HubEvents {
    inner: Arc<(Mutex<Slots>, Condvar)>,
}

impl HubEvents {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Outcome of `stage`, if it has resolved.
    #[must_use]
    pub fn outcome(&self, stage: Stage) -> Option<StageOutcome> {
        self.lock().slot(stage).clone()
    }

    /// Blocks until `stage` resolves.
    #[must_use]
    pub fn wait(&self, stage: Stage) -> StageOutcome {
        let (_, condvar) = &*self.inner;
        let mut slots = self.lock();
        loop {
            if let Some(outcome) = slots.slot(stage).clone() {
                return outcome;
            }
            slots = condvar
                .wait(slots)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until `stage` resolves or `timeout` elapses.
    #[must_use]
    pub fn wait_timeout(&self, stage: Stage, timeout: Duration) -> Option<StageOutcome> {
        let deadline = Instant::now() + timeout;
        let (_, condvar) = &*self.inner;
        let mut slots = self.lock();
        loop {
            if let Some(outcome) = slots.slot(stage).clone() {
                return Some(outcome);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slots = condvar
                .wait_timeout(slots, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn resolve(&self, stage: Stage, outcome: StageOutcome) {
        let mut slots = self.lock();
        let slot = slots.slot(stage);
        if slot.is_none() {
            *slot = Some(outcome);
            tracing::debug!(target: EVENTS_TARGET, stage = %stage, "hub stage resolved");
        }
        self.inner.1.notify_all();
    }

    pub(crate) fn listener(&self) -> EventsListener {
        EventsListener {
            events: self.clone(),
        }
    }
}

const EVENTS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::events");

/// Feeds [`HubEvents`] from the lifecycle hooks.
pub(crate) struct EventsListener {
    events: HubEvents,
}

impl LifecycleListener for EventsListener {
    fn after_initialization(&self, _hub: &Hub) -> Result<(), ProviderError> {
        self.events.resolve(Stage::Initialized, StageOutcome::Completed);
        Ok(())
    }

    fn after_start(&self, _hub: &Hub) {
        self.events.resolve(Stage::Started, StageOutcome::Completed);
    }

    fn before_exit(&self, _hub: &Hub, error: Option<&HubError>) {
        let unreached = error.map_or(StageOutcome::Skipped, |failure| {
            StageOutcome::Failed(failure.to_string())
        });
        self.events.resolve(Stage::Initialized, unreached.clone());
        self.events.resolve(Stage::Started, unreached);
        let exited = error.map_or(StageOutcome::Completed, |failure| {
            StageOutcome::Failed(failure.to_string())
        });
        self.events.resolve(Stage::Exited, exited);
    }
}

impl Hub {
    /// Handle reporting the Initialized, Started and Exited transitions.
    #[must_use]
    pub fn events(&self) -> HubEvents {
        self.shared.events.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rstest::rstest;

    use super::*;

    #[rstest]
    fn waiters_wake_when_a_stage_resolves() {
        let events = HubEvents::new();
        let remote = events.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.resolve(Stage::Started, StageOutcome::Completed);
        });

        assert_eq!(events.wait(Stage::Started), StageOutcome::Completed);
        handle.join().expect("resolver thread panicked");
    }

    #[rstest]
    fn stages_resolve_once() {
        let events = HubEvents::new();
        events.resolve(Stage::Initialized, StageOutcome::Completed);
        events.resolve(Stage::Initialized, StageOutcome::Failed("late".to_owned()));

        assert_eq!(
            events.outcome(Stage::Initialized),
            Some(StageOutcome::Completed)
        );
    }

    #[rstest]
    #[case(Stage::Initialized)]
    #[case(Stage::Started)]
    #[case(Stage::Exited)]
    fn unresolved_stages_time_out(#[case] stage: Stage) {
        let events = HubEvents::new();

        assert_eq!(events.wait_timeout(stage, Duration::from_millis(10)), None);
        assert_eq!(events.outcome(stage), None);
    }
}
