//! Concurrent Start and reverse-order Close.

use std::any::Any;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::cancel::CancelToken;
use crate::context::ProviderInstance;
use crate::error::{CloseError, HubError, StartError, TaskFailure};
use crate::hub::{HUB_TARGET, Hub, HubState, Lifecycle, Shared};
use crate::provider::{ProviderError, Runnable};

type TaskHandle = (String, JoinHandle<Result<(), String>>);

/// Decrements the outstanding-task counter when a task thread ends,
/// including by panic.
struct TaskGuard {
    shared: Arc<Shared>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut lifecycle = self.shared.lock();
        lifecycle.running = lifecycle.running.saturating_sub(1);
        if lifecycle.running == 0 {
            self.shared.idle.notify_all();
        }
    }
}

fn run_instance(instance: &ProviderInstance) -> Result<(), ProviderError> {
    match instance.provider().runnable() {
        Some(Runnable::StartStop(runnable)) => runnable.start(),
        Some(Runnable::Cancellable(runnable)) => runnable.run(instance.cancel_token()),
        None => Ok(()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_owned()
    }
}

impl Hub {
    /// Launches every runnable instance and background task on its own
    /// thread and blocks until all of them have returned.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidState`] unless the hub is initialised, or
    /// [`HubError::Start`] listing every task that failed or panicked.
    pub fn start(&self) -> Result<(), HubError> {
        self.start_then(|| {})
    }

    pub(crate) fn start_then<F>(&self, on_started: F) -> Result<(), HubError>
    where
        F: FnOnce(),
    {
        let (handles, mut failures) = {
            let mut lifecycle = self.shared.lock();
            if lifecycle.state != HubState::Initialized {
                return Err(HubError::InvalidState {
                    expected: HubState::Initialized,
                    actual: lifecycle.state,
                });
            }
            let launched = self.launch(&mut lifecycle);
            lifecycle.state = HubState::Started;
            launched
        };
        tracing::info!(target: HUB_TARGET, tasks = handles.len(), "providers started");

        on_started();
        for listener in &self.shared.listeners {
            listener.after_start(self);
        }

        for (key, handle) in handles {
            let outcome = handle
                .join()
                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())));
            if let Err(message) = outcome {
                tracing::error!(target: HUB_TARGET, key = %key, error = %message, "provider task failed");
                failures.push(TaskFailure::new(key, message));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StartError::new(failures).into())
        }
    }

    fn launch(&self, lifecycle: &mut Lifecycle) -> (Vec<TaskHandle>, Vec<TaskFailure>) {
        let mut handles = Vec::new();
        let mut failures = Vec::new();
        let order = self
            .provider_graph()
            .map(|graph| graph.order().to_vec())
            .unwrap_or_default();

        for instance in order {
            if instance.provider().runnable().is_some() {
                let runner = Arc::clone(&instance);
                let key = instance.key().to_owned();
                match self.spawn(lifecycle, &key, move || {
                    run_instance(&runner).map_err(|error| error.to_string())
                }) {
                    Ok(handle) => handles.push((key, handle)),
                    Err(failure) => failures.push(failure),
                }
            }
            for task in instance.take_tasks() {
                let key = format!("{}:{}", instance.key(), task.name);
                let token: CancelToken = instance.cancel_token().clone();
                let run = task.run;
                match self.spawn(lifecycle, &key, move || {
                    run(token).map_err(|error| error.to_string())
                }) {
                    Ok(handle) => handles.push((key, handle)),
                    Err(failure) => failures.push(failure),
                }
            }
        }
        (handles, failures)
    }

    fn spawn<F>(
        &self,
        lifecycle: &mut Lifecycle,
        key: &str,
        body: F,
    ) -> Result<JoinHandle<Result<(), String>>, TaskFailure>
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        lifecycle.running += 1;
        let shared = Arc::clone(&self.shared);
        let task_key = key.to_owned();
        thread::Builder::new()
            .name(key.to_owned())
            .spawn(move || {
                let _guard = TaskGuard { shared };
                tracing::debug!(target: HUB_TARGET, key = %task_key, "provider task running");
                body()
            })
            .map_err(|error| {
                lifecycle.running -= 1;
                TaskFailure::new(key, format!("failed to spawn thread: {error}"))
            })
    }

    /// Stops every started instance in reverse Init order and waits for all
    /// Start tasks to return.
    ///
    /// Does nothing unless the hub has started; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Close`] listing every failed `stop`.
    pub fn close(&self) -> Result<(), HubError> {
        {
            let mut lifecycle = self.shared.lock();
            if lifecycle.state != HubState::Started {
                return Ok(());
            }
            lifecycle.state = HubState::Closing;
        }
        tracing::info!(target: HUB_TARGET, "closing providers");

        let mut failures = Vec::new();
        let order = self
            .provider_graph()
            .map(|graph| graph.order().to_vec())
            .unwrap_or_default();
        for instance in order.iter().rev() {
            if let Some(Runnable::StartStop(runnable)) = instance.provider().runnable() {
                if let Err(error) = runnable.stop() {
                    tracing::error!(
                        target: HUB_TARGET,
                        key = instance.key(),
                        error = %error,
                        "provider failed to close"
                    );
                    failures.push(TaskFailure::new(instance.key(), error.to_string()));
                }
            }
            instance.cancel_token().cancel();
            tracing::debug!(target: HUB_TARGET, key = instance.key(), "provider closed");
        }

        let mut lifecycle = self.shared.lock();
        while lifecycle.running > 0 {
            lifecycle = self
                .shared
                .idle
                .wait(lifecycle)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        lifecycle.state = HubState::Closed;
        drop(lifecycle);
        tracing::info!(target: HUB_TARGET, "providers closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError::new(failures).into())
        }
    }
}
