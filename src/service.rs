//! Services, their method tables and the registry that resolves them.
//!
//! A [ServiceMethods] value is the dispatch surface of one service: a
//! table of async method handlers plus the events the service declares.
//! Handlers receive a [CallContext] carrying the session identity and any
//! delegate arguments, already materialized as [RemoteDelegate] proxies
//! that call back into the client.
//!
//! The [ServiceRegistry] stands in for an external DI container: it
//! resolves a service by name and knows its lifetime. A singleton service
//! is shared across calls; a per-call service is built fresh from its
//! factory for every invocation.

use futures::future::BoxFuture;
use futures::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::RemoteInvocationError;
use crate::guid::Guid;
use crate::message::{Credential, Identity};

/// Authenticates the credential set presented during the `auth` exchange.
pub trait AuthenticationProvider: Send + Sync {
    /// `Some(identity)` on success, `None` to reject.
    fn authenticate(&self, credentials: &[Credential]) -> Option<Identity>;
}

/// A server-side stand-in for a client-resident callback.
///
/// Invoking it enqueues an `invoke` wire message carrying the handler key
/// and the arguments on the session's ordered writer. Invocations are
/// fire-and-forget; errors in the client callback never travel back.
#[derive(Clone)]
pub struct RemoteDelegate {
    handler_key: Guid,
    invoker: Arc<dyn Fn(Guid, Vec<serde_json::Value>) + Send + Sync>,
}

impl RemoteDelegate {
    pub(crate) fn new(
        handler_key: Guid,
        invoker: Arc<dyn Fn(Guid, Vec<serde_json::Value>) + Send + Sync>,
    ) -> Self {
        Self {
            handler_key,
            invoker,
        }
    }

    pub fn handler_key(&self) -> Guid {
        self.handler_key
    }

    pub fn invoke(&self, arguments: Vec<serde_json::Value>) {
        (self.invoker)(self.handler_key, arguments);
    }
}

impl std::fmt::Debug for RemoteDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDelegate")
            .field("handler_key", &self.handler_key)
            .finish()
    }
}

/// Per-invocation context handed to every method handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub session_id: Guid,
    pub identity: Option<Identity>,
    service: String,
    delegates: Vec<(String, RemoteDelegate)>,
    events: Arc<crate::server::events::EventStub>,
}

impl CallContext {
    pub(crate) fn new(
        session_id: Guid,
        identity: Option<Identity>,
        service: String,
        delegates: Vec<(String, RemoteDelegate)>,
        events: Arc<crate::server::events::EventStub>,
    ) -> Self {
        Self {
            session_id,
            identity,
            service,
            delegates,
            events,
        }
    }

    /// Name of the service this call targets.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The delegate passed for the parameter named `name`, if any.
    pub fn delegate(&self, name: &str) -> Option<&RemoteDelegate> {
        self.delegates
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, delegate)| delegate)
    }

    /// All delegate arguments in parameter order.
    pub fn delegates(&self) -> impl Iterator<Item = &RemoteDelegate> {
        self.delegates.iter().map(|(_, delegate)| delegate)
    }

    /// Fire one of this service's events to every subscribed client.
    /// Returns the number of subscribers reached.
    pub fn fire_event(&self, event: &str, arguments: Vec<serde_json::Value>) -> usize {
        self.events.fire(&self.service, event, arguments)
    }
}

/// What a method handler produces: the return value and any out
/// parameters to echo back to the caller.
#[derive(Debug, Clone, Default)]
pub struct MethodResult {
    pub return_value: serde_json::Value,
    pub out_parameters: Vec<crate::message::Parameter>,
}

impl MethodResult {
    /// A result carrying only a return value.
    pub fn value(value: impl serde::Serialize) -> Result<Self, RemoteInvocationError> {
        let return_value = serde_json::to_value(value).map_err(|error| {
            RemoteInvocationError::new(format!("Failed to serialize return value: {}", error))
        })?;
        Ok(Self {
            return_value,
            out_parameters: Vec::new(),
        })
    }

    /// The unit result: a null return value.
    pub fn void() -> Self {
        Self::default()
    }

    pub fn with_out_parameter(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.out_parameters
            .push(crate::message::Parameter::scalar(name, type_name, value));
        self
    }
}

type MethodHandler = Box<
    dyn Fn(
            CallContext,
            Vec<serde_json::Value>,
        ) -> BoxFuture<'static, Result<MethodResult, RemoteInvocationError>>
        + Send
        + Sync,
>;

struct MethodEntry {
    handler: MethodHandler,
    one_way: bool,
}

/// The method table of one service.
pub struct ServiceMethods {
    methods: HashMap<String, MethodEntry>,
    events: HashSet<String>,
}

impl ServiceMethods {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            events: HashSet::new(),
        }
    }

    /// Register an async method. Scalar arguments deserialize into `T`
    /// (use a tuple for multiple parameters); delegate arguments arrive
    /// through the [CallContext].
    pub fn add_method<T, F, Fut>(&mut self, name: impl ToString, f: F)
    where
        T: serde::de::DeserializeOwned + 'static,
        F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodResult, RemoteInvocationError>> + Send + 'static,
    {
        self.insert(name.to_string(), false, f);
    }

    /// Register a method that produces no reply. Errors are reported to
    /// the server's error sink only.
    pub fn add_one_way<T, F, Fut>(&mut self, name: impl ToString, f: F)
    where
        T: serde::de::DeserializeOwned + 'static,
        F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodResult, RemoteInvocationError>> + Send + 'static,
    {
        self.insert(name.to_string(), true, f);
    }

    /// Declare an event clients can subscribe to with `add_<name>` /
    /// `remove_<name>` accessors.
    pub fn add_event(&mut self, name: impl ToString) {
        self.events.insert(name.to_string());
    }

    fn insert<T, F, Fut>(&mut self, name: String, one_way: bool, f: F)
    where
        T: serde::de::DeserializeOwned + 'static,
        F: Fn(CallContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<MethodResult, RemoteInvocationError>> + Send + 'static,
    {
        self.methods.insert(
            name,
            MethodEntry {
                one_way,
                handler: Box::new(move |context, args| {
                    let args = serde_json::Value::Array(args);
                    match serde_json::from_value::<T>(args) {
                        Ok(args) => f(context, args).boxed(),
                        Err(error) => futures::future::ready(Err(RemoteInvocationError::new(
                            format!("Failed to deserialize arguments: {}", error),
                        )))
                        .boxed(),
                    }
                }),
            },
        );
    }

    pub(crate) fn method(
        &self,
        name: &str,
    ) -> Option<(
        &(dyn Fn(
            CallContext,
            Vec<serde_json::Value>,
        ) -> BoxFuture<'static, Result<MethodResult, RemoteInvocationError>>
              + Send
              + Sync),
        bool,
    )> {
        self.methods
            .get(name)
            .map(|entry| (entry.handler.as_ref(), entry.one_way))
    }

    pub(crate) fn has_event(&self, name: &str) -> bool {
        self.events.contains(name)
    }
}

impl Default for ServiceMethods {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMethods")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}

/// Lifetime of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLifetime {
    /// One instance shared by every call.
    Singleton,
    /// A fresh instance per invocation.
    PerCall,
}

enum ServiceProvider {
    Singleton(Arc<ServiceMethods>),
    Factory(Box<dyn Fn() -> ServiceMethods + Send + Sync>),
}

struct ServiceRegistration {
    lifetime: ServiceLifetime,
    provider: ServiceProvider,
}

/// Resolves service instances by name.
pub struct ServiceRegistry {
    services: HashMap<String, ServiceRegistration>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Register a singleton service.
    pub fn register(&mut self, name: impl ToString, service: ServiceMethods) {
        self.services.insert(
            name.to_string(),
            ServiceRegistration {
                lifetime: ServiceLifetime::Singleton,
                provider: ServiceProvider::Singleton(Arc::new(service)),
            },
        );
    }

    /// Register a per-call service built from `factory` for every
    /// invocation.
    pub fn register_per_call(
        &mut self,
        name: impl ToString,
        factory: impl Fn() -> ServiceMethods + Send + Sync + 'static,
    ) {
        self.services.insert(
            name.to_string(),
            ServiceRegistration {
                lifetime: ServiceLifetime::PerCall,
                provider: ServiceProvider::Factory(Box::new(factory)),
            },
        );
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<(Arc<ServiceMethods>, ServiceLifetime)> {
        let registration = self.services.get(name)?;
        let service = match &registration.provider {
            ServiceProvider::Singleton(service) => Arc::clone(service),
            ServiceProvider::Factory(factory) => Arc::new(factory()),
        };
        Some((service, registration.lifetime))
    }

    /// The declared lifetime of `name`, without instantiating anything.
    pub(crate) fn lifetime(&self, name: &str) -> Option<ServiceLifetime> {
        self.services
            .get(name)
            .map(|registration| registration.lifetime)
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn context() -> CallContext {
        CallContext::new(
            Guid::random(),
            None,
            "TestService".to_string(),
            Vec::new(),
            Arc::new(crate::server::events::EventStub::new(Default::default())),
        )
    }

    #[async_std::test]
    async fn typed_arguments_deserialize() {
        let mut service = ServiceMethods::new();
        service.add_method("Concat", |_ctx, (a, b): (String, u32)| async move {
            MethodResult::value(format!("{}-{}", a, b))
        });

        let (handler, one_way) = service.method("Concat").unwrap();
        assert!(!one_way);
        let result = handler(
            context(),
            vec![serde_json::json!("x"), serde_json::json!(7)],
        )
        .await
        .unwrap();
        assert_eq!(result.return_value, serde_json::json!("x-7"));
    }

    #[async_std::test]
    async fn argument_mismatch_is_an_invocation_error() {
        let mut service = ServiceMethods::new();
        service.add_method("TakesNumber", |_ctx, (_n,): (u32,)| async move {
            Ok(MethodResult::void())
        });

        let (handler, _) = service.method("TakesNumber").unwrap();
        let error = handler(context(), vec![serde_json::json!("not a number")])
            .await
            .unwrap_err();
        assert!(error.message.contains("deserialize"));
    }

    #[test]
    fn per_call_services_are_fresh() {
        let mut registry = ServiceRegistry::new();
        registry.register_per_call("Scoped", || {
            let mut service = ServiceMethods::new();
            service.add_method("Noop", |_ctx, _: Vec<()>| async { Ok(MethodResult::void()) });
            service
        });

        let (first, lifetime) = registry.resolve("Scoped").unwrap();
        let (second, _) = registry.resolve("Scoped").unwrap();
        assert_eq!(lifetime, ServiceLifetime::PerCall);
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn missing_service_resolves_to_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.resolve("Nope").is_none());
    }
}
