use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    Freeze, Frozen, GroupReference, Injector, Service, ServiceFuture, ServiceId, ServiceName,
    container::ContainerHandle,
    controller::PendingService,
    injector::{Inject, Reference},
};

/// Everything the container needs to know about a [`Service`], as declared through a
/// [`ServiceBuilder`]. Immutable once built.
pub(crate) struct ServiceDescriptor<S: Service> {
    pub(crate) name: ServiceName<S::Value>,
    pub(crate) service: S,
    pub(crate) dependencies: Frozen<BTreeSet<String>>,
    pub(crate) injectors: Frozen<BTreeMap<String, Vec<Arc<dyn Inject>>>>,
    pub(crate) group: Option<String>,
    pub(crate) references: Frozen<BTreeMap<String, Arc<dyn Reference>>>,
}

/// Declares a [`Service`] along with its dependencies before installing it into a
/// [`ServiceContainer`].
///
/// Created with [`ServiceContainer::create_service`] or, for services scoped to another one, with
/// [`ServiceStartContext::create_service`].
///
/// [`ServiceContainer`]: crate::ServiceContainer
/// [`ServiceContainer::create_service`]: crate::ServiceContainer::create_service
/// [`ServiceStartContext::create_service`]: crate::ServiceStartContext::create_service
pub struct ServiceBuilder<S: Service> {
    name: ServiceName<S::Value>,
    service: S,
    container: ContainerHandle,
    dependencies: BTreeSet<String>,
    injectors: BTreeMap<String, Vec<Arc<dyn Inject>>>,
    group: Option<String>,
    references: BTreeMap<String, Arc<dyn Reference>>,
}

impl<S: Service> ServiceBuilder<S> {
    pub(crate) fn new(
        name: &ServiceName<S::Value>,
        service: S,
        container: ContainerHandle,
    ) -> Self {
        Self {
            name: name.clone(),
            service,
            container,
            dependencies: Default::default(),
            injectors: Default::default(),
            group: None,
            references: Default::default(),
        }
    }

    pub fn name(&self) -> &ServiceName<S::Value> {
        &self.name
    }

    /// Declares a dependency without receiving its value.
    pub fn dependency(mut self, id: impl ServiceId) -> Self {
        self.dependencies.insert(id.svc_id());
        self
    }

    /// Declares a dependency on `name` and binds `injector` to it. The injector will receive the
    /// value exposed by that service before this one starts.
    ///
    /// Several injectors can be bound to the same dependency.
    pub fn inject<T>(mut self, name: &ServiceName<T>, injector: &Injector<T>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.dependencies.insert(name.svc_id());
        self.injectors
            .entry(name.svc_id())
            .or_default()
            .push(Arc::new(injector.clone()));
        self
    }

    /// Makes this service a member of `group`: once started, its value is handed to every
    /// [`GroupReference`] bound to that group.
    pub fn group(mut self, group: &ServiceName<S::Value>) -> Self {
        self.group = Some(group.svc_id());
        self
    }

    /// Binds `reference` to every member of `group`. This does not create any dependency: members
    /// are added and removed as they start and stop.
    pub fn group_reference<T>(
        mut self,
        group: &ServiceName<T>,
        reference: &GroupReference<T>,
    ) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.references.insert(group.svc_id(), Arc::new(reference.clone()));
        self
    }

    /// Installs the service into the container.
    ///
    /// The installation request is sent right away. The returned future resolves to the value
    /// exposed by the service once it has started.
    ///
    /// # Errors
    ///
    /// The future fails with:
    ///
    /// - [`NamingConflict`] if a service with the same name is already installed.
    /// - [`InvalidContainerState`] if the container is not open.
    /// - [`Interrupted`] or [`RemovedWhileStarting`] if the service was removed before it could
    ///   start.
    /// - [`StartFailure`] if [`Service::start`] failed.
    ///
    /// [`NamingConflict`]: crate::ServiceError::NamingConflict
    /// [`InvalidContainerState`]: crate::ServiceError::InvalidContainerState
    /// [`Interrupted`]: crate::ServiceError::Interrupted
    /// [`RemovedWhileStarting`]: crate::ServiceError::RemovedWhileStarting
    /// [`StartFailure`]: crate::ServiceError::StartFailure
    pub fn install(self) -> ServiceFuture<S::Value> {
        let (sx, future) = ServiceFuture::pending();
        let Self {
            name,
            service,
            container,
            dependencies,
            injectors,
            group,
            references,
        } = self;

        let descriptor = ServiceDescriptor {
            name,
            service,
            dependencies: dependencies.freeze(),
            injectors: injectors.freeze(),
            group,
            references: references.freeze(),
        };
        container.install(Box::new(PendingService::new(descriptor, sx)));

        future
    }
}
