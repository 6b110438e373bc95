use std::{fmt, future::Future, pin::Pin, time::Duration};

use crate::{
    CompositeServiceBuilder, ServiceBuilder, ServiceError, ServiceFuture, ServiceId, ServiceName,
    container::ContainerHandle,
};

/// Maximum duration a service is expected to take to complete an asynchronous start or stop, after
/// which a warning is logged. The service is _not_ cancelled: the container keeps waiting for it.
pub const SERVICE_GRACE_PERIOD: Duration = Duration::from_secs(10);

pub(crate) type BoxedCompletion = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub(crate) type BlockingAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Deferred completion requested by a [`Service`] during `start` or `stop`.
pub(crate) enum Completion {
    Future(BoxedCompletion),
    Blocking(BlockingAction),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Future(_) => f.write_str("Completion::Future"),
            Self::Blocking(_) => f.write_str("Completion::Blocking"),
        }
    }
}

/// A subsystem of your program, managed by a [`ServiceContainer`].
///
/// A service is registered under a [`ServiceName`] together with the names of the services it
/// depends on. The container guarantees that [`start`] is only called once every dependency has
/// started, and that [`stop`] is only called once every service depending on this one has been
/// removed. Each of `start` and `stop` is called at most once per installation.
///
/// # Synchronous and asynchronous lifecycle
///
/// By default a service is considered started as soon as [`start`] returns `Ok`. Services which need
/// to wait on some other task before they are usable can instead request asynchronous completion
/// from the context with [`ServiceStartContext::run_async`] (or [`ServiceStartContext::run`] for
/// blocking work). The service is then considered started only once that future resolves. The same
/// goes for [`stop`].
///
/// While a start is pending, the service can still be asked to stop. If the start was marked as
/// _interruptible_, the pending future is dropped and [`stop`] is called right away with
/// [`ServiceStopContext::was_interrupted`] set. Otherwise, the stop request is honored once the start
/// completes.
///
/// # Failures
///
/// If `start` fails, the error is returned to whoever installed the service and [`stop`] is _not_
/// called: a service is expected not to hold any resource until it has started successfully. If
/// `stop` fails, the error is logged and the service is removed anyway.
///
/// ## example
///
/// ```rust
/// # use service_container::{Service, ServiceContainer, ServiceName, ServiceStartContext, Injector};
/// # use std::sync::Arc;
/// struct LogStorage;
///
/// #[async_trait::async_trait]
/// impl Service for LogStorage {
///     type Value = Arc<String>;
///
///     fn get(&self) -> Self::Value {
///         Arc::new("/var/log/storage".to_string())
///     }
/// }
///
/// struct Replication {
///     storage: Injector<Arc<String>>,
/// }
///
/// #[async_trait::async_trait]
/// impl Service for Replication {
///     type Value = ();
///
///     async fn start(&mut self, ctx: &mut ServiceStartContext) -> anyhow::Result<()> {
///         let storage = self.storage.get().expect("Storage is always injected before start");
///         ctx.run_async(async move {
///             println!("Replicating from {storage}");
///             anyhow::Ok(())
///         }, false)?;
///         Ok(())
///     }
///
///     fn get(&self) -> Self::Value {}
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let storage = ServiceName::<Arc<String>>::new("storage");
///     let replication = ServiceName::<()>::new("replication");
///
///     let container = ServiceContainer::new();
///     container.start()?;
///
///     let injector = Injector::new();
///     let installed = container
///         .create_service(&replication, Replication { storage: injector.clone() })
///         .inject(&storage, &injector)
///         .install();
///     container.create_service(&storage, LogStorage).install().await?;
///     installed.await?;
///
///     container.close(std::time::Duration::from_secs(1)).await?;
///     Ok(())
/// }
/// ```
///
/// [`ServiceContainer`]: crate::ServiceContainer
/// [`start`]: Self::start
/// [`stop`]: Self::stop
#[async_trait::async_trait]
pub trait Service: 'static + Send + Sync {
    /// The value exposed to dependents through their [`Injector`]s once this service has started.
    ///
    /// [`Injector`]: crate::Injector
    type Value: Clone + Send + Sync + 'static;

    /// Default impl starts synchronously and does nothing.
    #[allow(unused_variables)]
    async fn start(&mut self, ctx: &mut ServiceStartContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Default impl stops synchronously and does nothing.
    #[allow(unused_variables)]
    async fn stop(&mut self, ctx: &mut ServiceStopContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn get(&self) -> Self::Value;
}

/// Context handed to [`Service::start`].
///
/// The context only lives for the duration of the call, anything requested through it afterwards
/// is impossible by construction.
pub struct ServiceStartContext {
    name: String,
    container: ContainerHandle,
    completion: Option<Completion>,
    interruptible: bool,
}

impl ServiceStartContext {
    pub(crate) fn new(name: &str, container: ContainerHandle) -> Self {
        Self {
            name: name.to_string(),
            container,
            completion: None,
            interruptible: false,
        }
    }

    pub(crate) fn into_completion(self) -> (Option<Completion>, bool) {
        (self.completion, self.interruptible)
    }

    /// The name of the service being started.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marks the service as started only once `future` completes.
    ///
    /// If `interruptible` is `true`, a stop request arriving while `future` is pending will drop it
    /// and fail the installation with [`ServiceError::Interrupted`].
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyAsync`] if asynchronous completion was already requested.
    pub fn run_async<F>(&mut self, future: F, interruptible: bool) -> Result<(), ServiceError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.complete_with(Completion::Future(Box::pin(future)))?;
        self.interruptible = interruptible;
        Ok(())
    }

    /// Marks the service as started only once `action` has run to completion on a thread where
    /// blocking is acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyAsync`] if asynchronous completion was already requested.
    pub fn run(
        &mut self,
        action: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), ServiceError> {
        self.complete_with(Completion::Blocking(Box::new(action)))
    }

    fn complete_with(&mut self, completion: Completion) -> Result<(), ServiceError> {
        if self.completion.is_some() {
            return Err(ServiceError::AlreadyAsync);
        }
        self.completion = Some(completion);
        Ok(())
    }

    /// Creates a new service which depends on the service being started. It will only start once
    /// the current service has started, and will be removed if the current service is removed.
    pub fn create_service<S: Service>(
        &self,
        name: &ServiceName<S::Value>,
        service: S,
    ) -> ServiceBuilder<S> {
        ServiceBuilder::new(name, service, self.container.clone()).dependency(self.name.as_str())
    }

    /// Creates a new composite service which depends on the service being started.
    pub fn create_composite(&self, name: &ServiceName<()>) -> CompositeServiceBuilder {
        CompositeServiceBuilder::new(name, self.container.clone()).dependency(self.name.as_str())
    }

    pub fn remove_service(&self, id: impl ServiceId) -> ServiceFuture<()> {
        self.container.remove_service(id.svc_id())
    }

    pub fn has_service(&self, id: impl ServiceId) -> ServiceFuture<bool> {
        self.container.has_service(id.svc_id())
    }
}

/// Context handed to [`Service::stop`].
pub struct ServiceStopContext {
    name: String,
    container: ContainerHandle,
    completion: Option<Completion>,
    interrupted: bool,
}

impl ServiceStopContext {
    pub(crate) fn new(name: &str, container: ContainerHandle, interrupted: bool) -> Self {
        Self {
            name: name.to_string(),
            container,
            completion: None,
            interrupted,
        }
    }

    pub(crate) fn into_completion(self) -> Option<Completion> {
        self.completion
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if the service is being stopped because its (interruptible) start was interrupted.
    pub fn was_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Marks the service as stopped only once `future` completes.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyAsync`] if asynchronous completion was already requested.
    pub fn run_async<F>(&mut self, future: F) -> Result<(), ServiceError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.complete_with(Completion::Future(Box::pin(future)))
    }

    /// Marks the service as stopped only once `action` has run to completion on a thread where
    /// blocking is acceptable.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::AlreadyAsync`] if asynchronous completion was already requested.
    pub fn run(
        &mut self,
        action: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), ServiceError> {
        self.complete_with(Completion::Blocking(Box::new(action)))
    }

    fn complete_with(&mut self, completion: Completion) -> Result<(), ServiceError> {
        if self.completion.is_some() {
            return Err(ServiceError::AlreadyAsync);
        }
        self.completion = Some(completion);
        Ok(())
    }

    pub fn remove_service(&self, id: impl ServiceId) -> ServiceFuture<()> {
        self.container.remove_service(id.svc_id())
    }
}
