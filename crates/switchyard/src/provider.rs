//! Contract implemented by pluggable providers.
//!
//! A provider is any `Send + Sync + 'static` value. Optional capabilities are
//! exposed through accessor methods returning trait objects, so the hub can
//! inspect an instance without knowing its concrete type.

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::context::{InitContext, ProviderLogger};
use crate::locator::ServiceRequest;

/// Error type returned by provider code.
pub type ProviderError = Box<dyn Error + Send + Sync>;

/// Type-erased shared value handed out by the service locator.
pub type Service = Arc<dyn Any + Send + Sync>;

/// Conversion of a shared provider into a type-erased [`Service`].
pub trait AsAny: Any + Send + Sync {
    /// Erases the concrete type of a shared provider.
    fn into_any(self: Arc<Self>) -> Service;

    /// Borrows the provider as [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T> AsAny for T
where
    T: Any + Send + Sync,
{
    fn into_any(self: Arc<Self>) -> Service {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A unit of functionality managed by the hub.
///
/// Every method has a default, so the smallest provider is an empty `impl`.
pub trait Provider: AsAny {
    /// Receives an injected value for `field`.
    ///
    /// Returns `false` when the provider has no such field or the value has
    /// the wrong type; the field is then left untouched.
    fn inject(&self, field: &str, value: Injected) -> bool {
        let _ = (field, value);
        false
    }

    /// Init capability.
    fn initializer(&self) -> Option<&dyn Initializer> {
        None
    }

    /// Start capability.
    fn runnable(&self) -> Option<Runnable<'_>> {
        None
    }

    /// Per-caller specialisation of the value handed out by the locator.
    fn factory(&self) -> Option<&dyn FactoryService> {
        None
    }
}

/// Providers with an initialisation step.
pub trait Initializer: Send + Sync {
    /// Called once, in dependency order, before any provider starts.
    ///
    /// # Errors
    ///
    /// A failure aborts hub initialisation.
    fn init(&self, context: &InitContext<'_>) -> Result<(), ProviderError>;
}

/// Providers with a paired start and stop.
pub trait StartStop: Send + Sync {
    /// Runs until [`StartStop::stop`] is called or the work completes.
    ///
    /// # Errors
    ///
    /// Failures are aggregated into the hub's start error.
    fn start(&self) -> Result<(), ProviderError>;

    /// Asks a running [`StartStop::start`] to return.
    ///
    /// # Errors
    ///
    /// Failures are aggregated into the hub's close error.
    fn stop(&self) -> Result<(), ProviderError>;
}

/// Providers that run until their cancellation token fires.
pub trait CancellableRun: Send + Sync {
    /// Runs until `cancel` fires or the work completes.
    ///
    /// # Errors
    ///
    /// Failures are aggregated into the hub's start error.
    fn run(&self, cancel: &CancelToken) -> Result<(), ProviderError>;
}

/// How a provider participates in Start.
#[derive(Clone, Copy)]
pub enum Runnable<'a> {
    /// Started with `start` and stopped with `stop`.
    StartStop(&'a dyn StartStop),
    /// Runs with a cancellation token fired on close.
    Cancellable(&'a dyn CancellableRun),
}

/// Providers that hand out a caller-specific value instead of themselves.
pub trait FactoryService: Send + Sync {
    /// Builds the value for `request`.
    ///
    /// Returning `None` hands out the provider itself.
    fn provide(&self, request: &ServiceRequest) -> Option<Service>;
}

/// Value passed to [`Provider::inject`].
#[derive(Clone)]
pub enum Injected {
    /// Logger scoped to the receiving instance.
    Logger(ProviderLogger),
    /// Merged configuration of the receiving instance.
    Config(Service),
    /// Resolved dependency.
    Service(Service),
}

impl Injected {
    /// Extracts the logger.
    #[must_use]
    pub fn into_logger(self) -> Option<ProviderLogger> {
        match self {
            Self::Logger(logger) => Some(logger),
            _ => None,
        }
    }

    /// Extracts the configuration as `C`.
    #[must_use]
    pub fn into_config<C>(self) -> Option<Arc<C>>
    where
        C: Any + Send + Sync,
    {
        match self {
            Self::Config(value) => value.downcast::<C>().ok(),
            _ => None,
        }
    }

    /// Extracts the dependency as `T`.
    #[must_use]
    pub fn into_service<T>(self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        match self {
            Self::Service(value) => value.downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Injected {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Logger(_) => formatter.write_str("Injected::Logger"),
            Self::Config(_) => formatter.write_str("Injected::Config"),
            Self::Service(_) => formatter.write_str("Injected::Service"),
        }
    }
}
