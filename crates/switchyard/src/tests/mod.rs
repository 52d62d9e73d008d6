//! Test suites for the switchyard hub.

mod lifecycle_behaviour;
mod support;
