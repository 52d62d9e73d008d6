//! Behavioural tests for the hub lifecycle.

use std::cell::RefCell;
use std::thread;
use std::time::{Duration, Instant};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use serde_json::json;

use super::support::{self, Behaviour, Journal, Spec, TestProvider};
use crate::{Hub, HubError, HubState, LocatorError, Registry};

type StepResult = Result<(), String>;

/// Scenario world shared across lifecycle steps.
#[derive(Default)]
struct LifecycleWorld {
    journal: Journal,
    registry: Option<Registry>,
    hub: Option<Hub>,
    init_error: Option<HubError>,
    start_result: Option<Result<(), HubError>>,
    start_elapsed: Option<Duration>,
}

impl LifecycleWorld {
    fn hub(&self) -> Result<&Hub, String> {
        self.hub.as_ref().ok_or_else(|| "hub was not built".to_owned())
    }

    fn initialise(&mut self, config: &serde_json::Value) -> StepResult {
        let registry = self
            .registry
            .take()
            .ok_or_else(|| "no providers registered".to_owned())?;
        let hub = support::hub(registry);
        if let Err(error) = hub.init(config, &support::args(&[])) {
            self.init_error = Some(error);
        }
        self.hub = Some(hub);
        Ok(())
    }
}

#[fixture]
fn world() -> RefCell<LifecycleWorld> {
    RefCell::new(LifecycleWorld::default())
}

#[given("the storage providers are registered")]
fn given_storage_providers(world: &RefCell<LifecycleWorld>) {
    let mut world = world.borrow_mut();
    let registry = support::storage_registry(&world.journal);
    world.registry = Some(registry);
}

#[given("a worker that fails after 100 milliseconds and a long-running listener")]
fn given_failing_worker(world: &RefCell<LifecycleWorld>) -> StepResult {
    let mut world = world.borrow_mut();
    let registry = support::registry(
        &world.journal,
        vec![
            Spec::new("worker", &["worker"])
                .behaving(Behaviour::FailAfter(Duration::from_millis(100), "worker crashed")),
            Spec::new("listener", &["listener"]).behaving(Behaviour::Cancellable),
        ],
    );
    world.registry = Some(registry);
    world.initialise(&json!({"worker": {}, "listener": {}}))?;
    match world.init_error.as_ref() {
        Some(error) => Err(format!("init failed: {error}")),
        None => Ok(()),
    }
}

#[when("the hub initialises db, two labeled caches and api")]
fn when_storage_initialises(world: &RefCell<LifecycleWorld>) -> StepResult {
    world.borrow_mut().initialise(&json!({
        "api": {},
        "cache@primary": {},
        "cache@replica": {},
        "db": {},
    }))
}

#[when("the hub is closed")]
fn when_hub_closed(world: &RefCell<LifecycleWorld>) -> StepResult {
    let world = world.borrow();
    world.hub()?.close().map_err(|error| error.to_string())
}

#[when("the hub starts and is closed after 300 milliseconds")]
fn when_started_and_closed(world: &RefCell<LifecycleWorld>) -> StepResult {
    let hub = world.borrow().hub()?.clone();
    let closer = hub.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        closer.close()
    });

    let began = Instant::now();
    let result = hub.start();
    let elapsed = began.elapsed();
    handle
        .join()
        .map_err(|_| "closer thread panicked".to_owned())?
        .map_err(|error| error.to_string())?;

    let mut world = world.borrow_mut();
    world.start_result = Some(result);
    world.start_elapsed = Some(elapsed);
    Ok(())
}

#[then("initialisation succeeds")]
fn then_initialisation_succeeds(world: &RefCell<LifecycleWorld>) {
    let world = world.borrow();
    assert!(
        world.init_error.is_none(),
        "init error: {:?}",
        world.init_error
    );
}

#[then("db and both caches initialise before api")]
fn then_dependencies_first(world: &RefCell<LifecycleWorld>) {
    let order = world.borrow().journal.keys("init:");
    let position = |key: &str| order.iter().position(|seen| seen == key);
    let api = position("api");
    for dependency in ["db", "cache@primary", "cache@replica"] {
        assert!(
            position(dependency) < api,
            "{dependency} must precede api in {order:?}"
        );
    }
}

#[then("looking up \"cache@replica\" returns the replica")]
fn then_replica_lookup(world: &RefCell<LifecycleWorld>) -> StepResult {
    let world = world.borrow();
    let replica = world
        .hub()?
        .service_as::<TestProvider>("cache@replica")
        .map_err(|error| error.to_string())?;
    assert_eq!(replica.key(), "cache@replica");
    Ok(())
}

#[then("looking up \"cache\" fails as ambiguous")]
fn then_bare_lookup_ambiguous(world: &RefCell<LifecycleWorld>) -> StepResult {
    let world = world.borrow();
    let error = world
        .hub()?
        .service("cache")
        .err()
        .ok_or_else(|| "bare cache lookup succeeded".to_owned())?;
    assert!(
        matches!(error, LocatorError::Ambiguous { .. }),
        "unexpected error: {error}"
    );
    Ok(())
}

#[then("the hub is still initialised")]
fn then_still_initialised(world: &RefCell<LifecycleWorld>) -> StepResult {
    let world = world.borrow();
    assert_eq!(world.hub()?.state(), HubState::Initialized);
    Ok(())
}

#[then("start waited for the close")]
fn then_start_waited(world: &RefCell<LifecycleWorld>) {
    let elapsed = world.borrow().start_elapsed;
    assert!(
        elapsed.is_some_and(|elapsed| elapsed >= Duration::from_millis(300)),
        "start returned after {elapsed:?}"
    );
}

#[then("start reports the worker failure only")]
fn then_worker_failure_reported(world: &RefCell<LifecycleWorld>) -> StepResult {
    let world = world.borrow();
    match world.start_result.as_ref() {
        Some(Err(HubError::Start(error))) => {
            let keys: Vec<&str> = error.failures().iter().map(|failure| failure.key()).collect();
            assert_eq!(keys, vec!["worker"]);
            Ok(())
        }
        other => Err(format!("unexpected start result: {other:?}")),
    }
}

#[scenario(
    path = "tests/features/hub_lifecycle.feature",
    name = "Providers initialise after their dependencies"
)]
fn providers_initialise_after_dependencies(world: RefCell<LifecycleWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/hub_lifecycle.feature",
    name = "Labeled lookups return the labeled instance"
)]
fn labeled_lookups(world: RefCell<LifecycleWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/hub_lifecycle.feature",
    name = "Closing before starting changes nothing"
)]
fn close_before_start(world: RefCell<LifecycleWorld>) {
    drop(world);
}

#[scenario(
    path = "tests/features/hub_lifecycle.feature",
    name = "A failing worker does not end start early"
)]
fn failing_worker(world: RefCell<LifecycleWorld>) {
    drop(world);
}
