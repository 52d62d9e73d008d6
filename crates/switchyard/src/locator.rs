//! Named and labeled service lookup.

use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::context::ProviderInstance;
use crate::graph::{Selection, select, split_request};
use crate::hub::Hub;
use crate::provider::{AsAny, Service};
use crate::registry::ServiceType;

/// Caller-specific options forwarded to factory services.
pub type ServiceOption = Arc<dyn Any + Send + Sync>;

/// Errors returned by the service locator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LocatorError {
    /// The hub has not built its provider graph yet.
    #[error("providers are not configured yet")]
    NotConfigured,
    /// No configured instance answers the request.
    #[error("service {service} not found")]
    NotFound {
        /// Requested service.
        service: String,
    },
    /// Several instances answer an unlabeled request.
    #[error("service {service} is ambiguous between {}", .candidates.join(", "))]
    Ambiguous {
        /// Requested service.
        service: String,
        /// Keys of the matching instances.
        candidates: Vec<String>,
    },
    /// The service is not of the requested type.
    #[error("service {service} has an unexpected type")]
    Downcast {
        /// Requested service.
        service: String,
    },
}

/// Identity of the instance asking for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    key: String,
    name: String,
    label: String,
}

impl Caller {
    /// Builds a caller identity.
    #[must_use]
    pub fn new(key: &str, name: &str, label: &str) -> Self {
        Self {
            key: key.to_owned(),
            name: name.to_owned(),
            label: label.to_owned(),
        }
    }

    /// Caller's instance key.
    #[must_use]
    pub const fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Caller's provider name.
    #[must_use]
    pub const fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Caller's label.
    #[must_use]
    pub const fn label(&self) -> &str {
        self.label.as_str()
    }
}

/// Request handed to [`FactoryService::provide`](crate::FactoryService::provide).
#[derive(Clone)]
pub struct ServiceRequest {
    caller: Option<Caller>,
    service: String,
    label: Option<String>,
    options: Option<ServiceOption>,
}

impl ServiceRequest {
    /// Instance asking for the service, when the lookup came from a provider.
    #[must_use]
    pub const fn caller(&self) -> Option<&Caller> {
        self.caller.as_ref()
    }

    /// Requested service name without label.
    #[must_use]
    pub const fn service(&self) -> &str {
        self.service.as_str()
    }

    /// Requested label, if any.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Options passed by the caller.
    #[must_use]
    pub const fn options(&self) -> Option<&ServiceOption> {
        self.options.as_ref()
    }

    /// Options downcast to `T`.
    #[must_use]
    pub fn options_as<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.options
            .as_deref()
            .and_then(|options| options.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for ServiceRequest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ServiceRequest")
            .field("caller", &self.caller)
            .field("service", &self.service)
            .field("label", &self.label)
            .field("options", &self.options.is_some())
            .finish()
    }
}

impl Hub {
    /// Resolves `requested` (`service` or `service@label`) without a caller.
    ///
    /// # Errors
    ///
    /// See [`Hub::locate`].
    pub fn service(&self, requested: &str) -> Result<Service, LocatorError> {
        self.locate(None, requested, None)
    }

    /// Resolves `requested` and downcasts it to `T`.
    ///
    /// # Errors
    ///
    /// See [`Hub::locate`]; fails with [`LocatorError::Downcast`] when the
    /// service is not a `T`.
    pub fn service_as<T>(&self, requested: &str) -> Result<Arc<T>, LocatorError>
    where
        T: Any + Send + Sync,
    {
        self.service(requested)?
            .downcast::<T>()
            .map_err(|_| LocatorError::Downcast {
                service: requested.to_owned(),
            })
    }

    /// Resolves `requested` on behalf of `caller`.
    ///
    /// Providers with a factory capability build a value for the caller;
    /// other providers are handed out as themselves.
    ///
    /// # Errors
    ///
    /// Fails when the graph is not built, nothing matches, or an unlabeled
    /// request matches several instances and none is canonical.
    pub fn locate(
        &self,
        caller: Option<&Caller>,
        requested: &str,
        options: Option<ServiceOption>,
    ) -> Result<Service, LocatorError> {
        let graph = self.provider_graph().ok_or(LocatorError::NotConfigured)?;
        let (service, label) = split_request(requested);
        let binding = graph.service(service).ok_or_else(|| LocatorError::NotFound {
            service: requested.to_owned(),
        })?;
        let instance = chosen(select(binding, requested, label), requested)?;
        Ok(provide(
            instance,
            ServiceRequest {
                caller: caller.cloned(),
                service: service.to_owned(),
                label: label.map(str::to_owned),
                options,
            },
        ))
    }

    /// Resolves the service declared with
    /// [`ProviderDefinition::with_service_type`](crate::ProviderDefinition::with_service_type).
    ///
    /// # Errors
    ///
    /// See [`Hub::locate_type`].
    pub fn service_of<T>(&self) -> Result<Arc<T>, LocatorError>
    where
        T: Any + Send + Sync,
    {
        self.locate_type::<T>(None, None)
    }

    /// Resolves the service declared as type `T` on behalf of `caller`.
    ///
    /// Several instances of the declaring provider resolve to the canonical
    /// one; without it the request is ambiguous. Factory requests carry the
    /// type name as their service.
    ///
    /// # Errors
    ///
    /// Fails when the graph is not built, no provider declares `T`, the
    /// instance cannot be chosen, or the value is not a `T`.
    pub fn locate_type<T>(
        &self,
        caller: Option<&Caller>,
        options: Option<ServiceOption>,
    ) -> Result<Arc<T>, LocatorError>
    where
        T: Any + Send + Sync,
    {
        let service_type = ServiceType::of::<T>();
        let service = service_type.name();
        let graph = self.provider_graph().ok_or(LocatorError::NotConfigured)?;
        let binding = graph
            .service_type(service_type.id())
            .ok_or_else(|| LocatorError::NotFound {
                service: service.to_owned(),
            })?;
        let instance = chosen(select(binding, service, None), service)?;
        let value = provide(
            instance,
            ServiceRequest {
                caller: caller.cloned(),
                service: service.to_owned(),
                label: None,
                options,
            },
        );
        value.downcast::<T>().map_err(|_| LocatorError::Downcast {
            service: service.to_owned(),
        })
    }
}

fn chosen<'a>(
    selection: Selection<'a>,
    requested: &str,
) -> Result<&'a Arc<ProviderInstance>, LocatorError> {
    match selection {
        Selection::Found(instance) => Ok(instance),
        Selection::Missing => Err(LocatorError::NotFound {
            service: requested.to_owned(),
        }),
        Selection::Ambiguous(candidates) => Err(LocatorError::Ambiguous {
            service: requested.to_owned(),
            candidates,
        }),
    }
}

/// Factory output when the provider builds one, the provider itself otherwise.
fn provide(instance: &ProviderInstance, request: ServiceRequest) -> Service {
    let provider = Arc::clone(instance.provider());
    if let Some(value) = provider
        .factory()
        .and_then(|factory| factory.provide(&request))
    {
        return value;
    }
    AsAny::into_any(provider)
}
