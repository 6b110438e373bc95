use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    CompositeServiceBuilder, ContainerState, Service, ServiceBuilder, ServiceError, ServiceFuture,
    ServiceId, ServiceName, ServiceState,
    controller::{Installable, Launch},
    future::Completer,
    injector::ServiceValue,
    resolver::{ControllerHandle, DependencyResolver},
};

pub(crate) enum ContainerMessage {
    Install(Box<dyn Installable>),
    Remove {
        name: String,
        reply: Completer<()>,
    },
    HasService {
        name: String,
        reply: Completer<bool>,
    },
    ServiceState {
        name: String,
        reply: Completer<Option<ServiceState>>,
    },
    DumpGraph {
        reply: Completer<String>,
    },
    Close {
        reply: Completer<()>,
    },
    StateChanged {
        name: String,
        state: ServiceState,
        value: Option<ServiceValue>,
    },
}

impl ContainerMessage {
    fn reject(self, error: ServiceError) {
        match self {
            Self::Install(pending) => pending.reject(error),
            Self::Remove { reply, .. } | Self::Close { reply } => {
                let _ = reply.send(Err(error));
            }
            Self::HasService { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::ServiceState { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Self::DumpGraph { reply } => {
                let _ = reply.send(Err(error));
            }
            Self::StateChanged { .. } => {}
        }
    }
}

/// Cheap, cloneable access to the container actor, shared by the [`ServiceContainer`], every
/// builder and every service context.
#[derive(Clone)]
pub(crate) struct ContainerHandle {
    sx: mpsc::UnboundedSender<ContainerMessage>,
    opened: Arc<AtomicBool>,
}

impl ContainerHandle {
    fn send(&self, operation: &'static str, message: ContainerMessage) {
        if !self.opened.load(Ordering::Acquire) {
            return message.reject(ServiceError::invalid_state(operation, ContainerState::New));
        }
        if let Err(mpsc::error::SendError(message)) = self.sx.send(message) {
            message.reject(ServiceError::invalid_state(operation, ContainerState::Closed));
        }
    }

    fn request<T>(
        &self,
        operation: &'static str,
        message: impl FnOnce(Completer<T>) -> ContainerMessage,
    ) -> ServiceFuture<T> {
        let (reply, future) = ServiceFuture::pending();
        self.send(operation, message(reply));
        future
    }

    pub(crate) fn install(&self, pending: Box<dyn Installable>) {
        self.send("install service", ContainerMessage::Install(pending));
    }

    pub(crate) fn remove_service(&self, name: String) -> ServiceFuture<()> {
        self.request("remove service", |reply| ContainerMessage::Remove { name, reply })
    }

    pub(crate) fn has_service(&self, name: String) -> ServiceFuture<bool> {
        self.request("query service", |reply| ContainerMessage::HasService { name, reply })
    }

    fn service_state(&self, name: String) -> ServiceFuture<Option<ServiceState>> {
        self.request("query service", |reply| ContainerMessage::ServiceState { name, reply })
    }

    fn dump_graph(&self) -> ServiceFuture<String> {
        self.request("dump service graph", |reply| ContainerMessage::DumpGraph { reply })
    }

    fn close(&self) -> ServiceFuture<()> {
        self.request("close service container", |reply| ContainerMessage::Close { reply })
    }

    pub(crate) fn state_changed(
        &self,
        name: &str,
        state: ServiceState,
        value: Option<ServiceValue>,
    ) {
        let _ = self.sx.send(ContainerMessage::StateChanged {
            name: name.to_string(),
            state,
            value,
        });
    }

    /// A handle to a container which was never started.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (sx, _) = mpsc::unbounded_channel();
        Self {
            sx,
            opened: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Owns the dependency graph. Every request made to the container and every state change reported
/// by a controller is processed here, one at a time.
struct ContainerActor {
    state: ContainerState,
    resolver: DependencyResolver,
    rx: mpsc::UnboundedReceiver<ContainerMessage>,
    handle: ContainerHandle,
    removals: BTreeMap<String, Vec<Completer<()>>>,
    closing: Vec<Completer<()>>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ContainerActor {
    async fn run(mut self) {
        self.state = ContainerState::Open;

        while self.state != ContainerState::Closed {
            let message = tokio::select! {
                message = self.rx.recv() => message,
                _ = self.token.cancelled() => None,
            };

            match message {
                Some(message) => self.on_message(message),
                None => break,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        self.state = ContainerState::Closed;
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            message.reject(ServiceError::invalid_state(
                "complete request",
                ContainerState::Closed,
            ));
        }

        if self.token.is_cancelled() {
            tracing::warn!("⚠️  Service container was closed forcefully");
            return;
        }

        self.tracker.close();
        self.tracker.wait().await;

        tracing::info!("🔌 Service container closed");
        for reply in self.closing.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    fn on_message(&mut self, message: ContainerMessage) {
        match message {
            ContainerMessage::Install(pending) => self.install(pending),
            ContainerMessage::Remove { name, reply } => self.remove(name, reply),
            ContainerMessage::HasService { name, reply } => {
                let _ = reply.send(Ok(self.resolver.contains(&name)));
            }
            ContainerMessage::ServiceState { name, reply } => {
                let _ = reply.send(Ok(self.resolver.state(&name)));
            }
            ContainerMessage::DumpGraph { reply } => {
                let _ = reply.send(Ok(self.resolver.dump()));
            }
            ContainerMessage::Close { reply } => self.close(reply),
            ContainerMessage::StateChanged { name, state, value } => {
                self.on_state_changed(name, state, value)
            }
        }
    }

    fn install(&mut self, pending: Box<dyn Installable>) {
        if self.state != ContainerState::Open {
            return pending.reject(ServiceError::invalid_state("install service", self.state));
        }

        let registration = pending.registration();
        let name = registration.name.clone();
        if self.resolver.contains(&name) {
            return pending.reject(ServiceError::NamingConflict(name));
        }

        tracing::debug!(
            "Installing service {name} with dependencies {:?}",
            registration.dependencies
        );

        let (sx, rx) = mpsc::unbounded_channel();
        self.resolver
            .register(registration, ControllerHandle::new(sx.clone()));
        pending.launch(Launch {
            sx,
            rx,
            container: self.handle.clone(),
            token: self.token.child_token(),
            tracker: self.tracker.clone(),
        });
    }

    fn remove(&mut self, name: String, reply: Completer<()>) {
        if self.resolver.request_removal(&name) {
            tracing::debug!("Removing service {name}");
            self.removals.entry(name).or_default().push(reply);
        } else {
            let _ = reply.send(Ok(()));
        }
    }

    fn on_state_changed(&mut self, name: String, state: ServiceState, value: Option<ServiceValue>) {
        tracing::trace!("Service {name} is now {state:?}");
        self.resolver.on_state_changed(&name, state, value);

        if state == ServiceState::Removed {
            tracing::debug!("Removed service {name}");
            for reply in self.removals.remove(&name).into_iter().flatten() {
                let _ = reply.send(Ok(()));
            }

            if self.state == ContainerState::Closing && self.resolver.is_empty() {
                self.state = ContainerState::Closed;
            }
        }
    }

    fn close(&mut self, reply: Completer<()>) {
        if self.state != ContainerState::Open {
            let _ = reply.send(Err(ServiceError::invalid_state(
                "close service container",
                self.state,
            )));
            return;
        }

        tracing::info!("🔌 Closing service container");
        self.state = ContainerState::Closing;
        self.closing.push(reply);

        for root in self.resolver.roots() {
            self.resolver.request_removal(&root);
        }
        if self.resolver.is_empty() {
            self.state = ContainerState::Closed;
        }
    }
}

enum Runtime {
    Idle(Box<ContainerActor>),
    Running(JoinHandle<()>),
    Stopped,
}

/// Manages the lifecycle of a set of interdependent [`Service`]s.
///
/// Services are installed with [`create_service`] and started as soon as all their dependencies
/// have started. Removing a service first removes every service depending on it, in reverse
/// dependency order. Closing the container removes every service it holds.
///
/// Every operation returns immediately: requests are processed in order by a background task, and
/// their result is available through the returned [`ServiceFuture`].
///
/// A container needs to be [`start`]ed inside a tokio runtime before it accepts any request.
///
/// [`create_service`]: Self::create_service
/// [`start`]: Self::start
pub struct ServiceContainer {
    handle: ContainerHandle,
    runtime: Mutex<Runtime>,
    token: CancellationToken,
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceContainer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ServiceContainer {
    pub fn new() -> Self {
        let (sx, rx) = mpsc::unbounded_channel();
        let handle = ContainerHandle {
            sx,
            opened: Arc::new(AtomicBool::new(false)),
        };
        let token = CancellationToken::new();
        let actor = ContainerActor {
            state: ContainerState::New,
            resolver: DependencyResolver::default(),
            rx,
            handle: handle.clone(),
            removals: BTreeMap::new(),
            closing: Vec::new(),
            token: token.clone(),
            tracker: TaskTracker::new(),
        };

        Self {
            handle,
            runtime: Mutex::new(Runtime::Idle(Box::new(actor))),
            token,
        }
    }

    /// Opens the container. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails with [`ServiceError::InvalidContainerState`] if the container was already started.
    #[tracing::instrument(skip(self), fields(module = "ServiceContainer"))]
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *runtime, Runtime::Stopped) {
            Runtime::Idle(actor) => {
                *runtime = Runtime::Running(tokio::spawn((*actor).run().in_current_span()));
                self.handle.opened.store(true, Ordering::Release);
                tracing::info!("🚀 Service container started");
                Ok(())
            }
            Runtime::Running(task) => {
                let state = if task.is_finished() {
                    ContainerState::Closed
                } else {
                    ContainerState::Open
                };
                *runtime = Runtime::Running(task);
                Err(ServiceError::invalid_state("start service container", state))
            }
            Runtime::Stopped => Err(ServiceError::invalid_state(
                "start service container",
                ContainerState::Closed,
            )),
        }
    }

    pub fn create_service<S: Service>(
        &self,
        name: &ServiceName<S::Value>,
        service: S,
    ) -> ServiceBuilder<S> {
        ServiceBuilder::new(name, service, self.handle.clone())
    }

    pub fn create_composite(&self, name: &ServiceName<()>) -> CompositeServiceBuilder {
        CompositeServiceBuilder::new(name, self.handle.clone())
    }

    /// Removes a service along with every service depending on it, dependents first.
    ///
    /// The returned future resolves once the service has been removed. Removing a service which is
    /// not installed succeeds immediately.
    pub fn remove_service(&self, id: impl ServiceId) -> ServiceFuture<()> {
        self.handle.remove_service(id.svc_id())
    }

    pub fn has_service(&self, id: impl ServiceId) -> ServiceFuture<bool> {
        self.handle.has_service(id.svc_id())
    }

    /// The current lifecycle state of a service, if it is installed.
    pub fn service_state(&self, id: impl ServiceId) -> ServiceFuture<Option<ServiceState>> {
        self.handle.service_state(id.svc_id())
    }

    /// A human readable view of every installed service and the state of its dependencies.
    pub fn dump_graph(&self) -> ServiceFuture<String> {
        self.handle.dump_graph()
    }

    /// Removes every service, in reverse dependency order. The returned future resolves once the
    /// container is empty.
    ///
    /// Once closing, the container rejects any new installation. It can no longer be used once
    /// closed.
    pub fn close_async(&self) -> ServiceFuture<()> {
        self.handle.close()
    }

    /// Same as [`close_async`], but gives up after `timeout`.
    ///
    /// On timeout, the services which could not be removed are logged and the container is closed
    /// forcefully: every pending start or stop is cancelled and any outstanding request is
    /// abandoned.
    ///
    /// [`close_async`]: Self::close_async
    #[tracing::instrument(skip(self), fields(module = "ServiceContainer"))]
    pub async fn close(&self, timeout: Duration) -> Result<(), ServiceError> {
        if let Ok(res) = tokio::time::timeout(timeout, self.close_async()).await {
            return res;
        }

        match self.dump_graph().await {
            Ok(graph) => tracing::debug!(
                "Service container failed to close in time. Unresolved services:\n{graph}"
            ),
            Err(e) => tracing::debug!("Service container failed to close in time: {e}"),
        }

        self.token.cancel();
        let runtime = std::mem::replace(
            &mut *self.runtime.lock().unwrap_or_else(PoisonError::into_inner),
            Runtime::Stopped,
        );
        if let Runtime::Running(task) = runtime {
            let _ = task.await;
        }

        Err(ServiceError::CloseTimeout(timeout))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        GroupReference, Injector, ServiceStartContext,
        testing::{CLOSE_TIMEOUT, Journal, Recorder, open_container},
    };
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    async fn wait_for_state(container: &ServiceContainer, id: &str, state: Option<ServiceState>) {
        while container
            .service_state(id)
            .await
            .expect("Failed to query service")
            != state
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn before(journal: &Journal, first: &str, second: &str) -> bool {
        let first = journal.position(first).expect(first);
        let second = journal.position(second).expect(second);
        first < second
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_inject_dependency() {
        let journal = Journal::default();
        let container = open_container();
        let storage = ServiceName::<String>::new("storage");
        let raft = ServiceName::<String>::new("raft");
        let injector = Injector::<String>::new();

        let raft_installed = container
            .create_service(&raft, Recorder::new("raft", &journal))
            .inject(&storage, &injector)
            .install();
        let storage_installed = container
            .create_service(&storage, Recorder::new("storage", &journal))
            .install();

        assert_eq!(storage_installed.await.expect("Failed to install"), "storage");
        assert_eq!(raft_installed.await.expect("Failed to install"), "raft");
        assert_eq!(injector.get().as_deref(), Some("storage"));
        assert_eq!(injector.injected_name().as_deref(), Some("storage"));
        assert!(container.has_service(&raft).await.expect("Failed to query"));

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
        assert!(!injector.is_injected());
        assert_eq!(
            journal.entries(),
            [
                "start:storage",
                "started:storage",
                "start:raft",
                "started:raft",
                "stop:raft",
                "stopped:raft",
                "stop:storage",
                "stopped:storage"
            ]
        );
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_waits_for_dependencies() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");
        let b = ServiceName::<String>::new("b");
        let c = ServiceName::<String>::new("c");

        let c_installed = container
            .create_service(&c, Recorder::new("c", &journal))
            .dependency(&a)
            .dependency(&b)
            .install();
        assert_eq!(
            container.service_state(&c).await.expect("Failed to query"),
            Some(ServiceState::AwaitDependenciesStarted)
        );

        let b_installed = container
            .create_service(&b, Recorder::new("b", &journal))
            .dependency(&a)
            .install();
        assert_eq!(
            container.service_state(&b).await.expect("Failed to query"),
            Some(ServiceState::AwaitDependenciesStarted)
        );
        assert!(journal.entries().is_empty());

        container
            .create_service(
                &a,
                Recorder::new("a", &journal).start_delay(Duration::from_millis(5), false),
            )
            .install()
            .await
            .expect("Failed to install a");
        b_installed.await.expect("Failed to install b");
        c_installed.await.expect("Failed to install c");

        assert!(before(&journal, "started:a", "start:b"));
        assert!(before(&journal, "started:b", "start:c"));
        assert_eq!(
            container.service_state(&c).await.expect("Failed to query"),
            Some(ServiceState::Started)
        );

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_remove_stops_dependents_first() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");
        let b = ServiceName::<String>::new("b");

        container
            .create_service(&a, Recorder::new("a", &journal))
            .install()
            .await
            .expect("Failed to install a");
        container
            .create_service(&b, Recorder::new("b", &journal).stop_delay(Duration::from_millis(5)))
            .dependency(&a)
            .install()
            .await
            .expect("Failed to install b");

        container.remove_service(&a).await.expect("Failed to remove a");

        assert!(before(&journal, "stopped:b", "stop:a"));
        assert!(!container.has_service(&a).await.expect("Failed to query"));
        assert!(!container.has_service(&b).await.expect("Failed to query"));
        assert_eq!(container.service_state(&b).await.expect("Failed to query"), None);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_interrupt_start() {
        let journal = Journal::default();
        let container = open_container();
        let c = ServiceName::<String>::new("c");

        let installed = container
            .create_service(
                &c,
                Recorder::new("c", &journal).start_delay(Duration::from_millis(100), true),
            )
            .install();
        tokio::time::sleep(Duration::from_millis(10)).await;

        container.remove_service(&c).await.expect("Failed to remove");
        assert_matches!(installed.await, Err(ServiceError::Interrupted(name)) if name == "c");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            journal.entries(),
            ["start:c", "stop:c", "interrupted:c", "stopped:c"]
        );

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_remove_while_starting() {
        let journal = Journal::default();
        let container = open_container();
        let c = ServiceName::<String>::new("c");

        let installed = container
            .create_service(
                &c,
                Recorder::new("c", &journal).start_delay(Duration::from_millis(50), false),
            )
            .install();
        tokio::time::sleep(Duration::from_millis(10)).await;

        container.remove_service(&c).await.expect("Failed to remove");
        assert_matches!(
            installed.await,
            Err(ServiceError::RemovedWhileStarting(name)) if name == "c"
        );
        assert_eq!(journal.entries(), ["start:c", "started:c", "stop:c", "stopped:c"]);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_naming_conflict() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");

        let (first, second) = tokio::join!(
            container.create_service(&a, Recorder::new("first", &journal)).install(),
            container.create_service(&a, Recorder::new("second", &journal)).install(),
        );

        assert_matches!(first, Ok(id) if id == "first");
        assert_matches!(second, Err(ServiceError::NamingConflict(name)) if name == "a");
        assert_eq!(journal.count("start:second"), 0);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_remove_idempotent() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");

        container.remove_service("unknown").await.expect("Failed to remove unknown service");

        container
            .create_service(&a, Recorder::new("a", &journal).stop_delay(Duration::from_millis(5)))
            .install()
            .await
            .expect("Failed to install");
        let (first, second) =
            tokio::join!(container.remove_service(&a), container.remove_service(&a));
        first.expect("Failed to remove");
        second.expect("Failed to remove");
        container.remove_service(&a).await.expect("Failed to remove");

        assert_eq!(journal.count("stop:a"), 1);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_start_failure() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");
        let b = ServiceName::<String>::new("b");

        let b_installed = container
            .create_service(&b, Recorder::new("b", &journal))
            .dependency(&a)
            .install();
        let a_installed = container
            .create_service(&a, Recorder::new("a", &journal).failing_start())
            .install();

        assert_matches!(
            a_installed.await,
            Err(ServiceError::StartFailure { name, source })
                if name == "a" && source.to_string() == "a refused to start"
        );
        assert_matches!(b_installed.await, Err(ServiceError::Interrupted(name)) if name == "b");

        wait_for_state(&container, "a", None).await;
        assert_eq!(journal.entries(), ["start:a"]);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_stop_failure() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");

        container
            .create_service(&a, Recorder::new("a", &journal).failing_stop())
            .install()
            .await
            .expect("Failed to install");
        container.remove_service(&a).await.expect("Failed to remove");

        assert!(!container.has_service(&a).await.expect("Failed to query"));
        assert_eq!(journal.entries(), ["start:a", "started:a", "stop:a"]);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_start_panic() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");

        assert_matches!(
            container
                .create_service(&a, Recorder::new("a", &journal).panicking_start())
                .install()
                .await,
            Err(ServiceError::StartFailure { name, source }) => {
                assert_eq!(name, "a");
                assert_eq!(source.to_string(), "start panicked: a blew up while starting");
            }
        );
        wait_for_state(&container, a.name(), None).await;

        // The container keeps serving requests
        container
            .create_service(&ServiceName::<String>::new("b"), Recorder::new("b", &journal))
            .install()
            .await
            .expect("Failed to install");
        assert_eq!(journal.entries(), ["start:a", "start:b", "started:b"]);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_stop_panic() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");
        let b = ServiceName::<String>::new("b");

        container
            .create_service(&a, Recorder::new("a", &journal))
            .install()
            .await
            .expect("Failed to install a");
        container
            .create_service(&b, Recorder::new("b", &journal).panicking_stop())
            .dependency(&a)
            .install()
            .await
            .expect("Failed to install b");

        container.remove_service(&a).await.expect("Failed to remove");

        assert!(!container.has_service(&a).await.expect("Failed to query"));
        assert!(!container.has_service(&b).await.expect("Failed to query"));
        assert!(before(&journal, "stop:b", "stop:a"));
        assert_eq!(journal.count("stopped:a"), 1);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_type_mismatch() {
        let journal = Journal::default();
        let container = open_container();
        let numbers = Injector::<u64>::new();

        container
            .create_service(&ServiceName::new("source"), Recorder::new("source", &journal))
            .install()
            .await
            .expect("Failed to install");
        let installed = container
            .create_service(&ServiceName::new("sink"), Recorder::new("sink", &journal))
            .inject(&ServiceName::<u64>::new("source"), &numbers)
            .install();

        assert_matches!(
            installed.await,
            Err(ServiceError::StartFailure { source, .. }) => {
                assert_matches!(
                    source.downcast_ref::<ServiceError>(),
                    Some(ServiceError::TypeMismatch { dependency, .. }) if dependency == "source"
                );
            }
        );
        assert_eq!(journal.count("start:sink"), 0);
        assert!(!numbers.is_injected());

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    struct Greedy;

    #[async_trait::async_trait]
    impl Service for Greedy {
        type Value = ();

        async fn start(&mut self, ctx: &mut ServiceStartContext) -> anyhow::Result<()> {
            ctx.run_async(async { anyhow::Ok(()) }, false)?;
            ctx.run(|| Ok(()))?;
            Ok(())
        }

        fn get(&self) -> Self::Value {}
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_already_async() {
        let container = open_container();

        assert_matches!(
            container
                .create_service(&ServiceName::new("greedy"), Greedy)
                .install()
                .await,
            Err(ServiceError::StartFailure { source, .. }) => {
                assert_matches!(
                    source.downcast_ref::<ServiceError>(),
                    Some(ServiceError::AlreadyAsync)
                );
            }
        );

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    struct Blocking;

    #[async_trait::async_trait]
    impl Service for Blocking {
        type Value = u32;

        async fn start(&mut self, ctx: &mut ServiceStartContext) -> anyhow::Result<()> {
            ctx.run(|| {
                std::thread::sleep(Duration::from_millis(10));
                Ok(())
            })?;
            Ok(())
        }

        fn get(&self) -> Self::Value {
            7
        }
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_blocking_start() {
        let container = open_container();
        let blocking = ServiceName::<u32>::new("blocking");

        assert_matches!(container.create_service(&blocking, Blocking).install().await, Ok(7));

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    struct Parent {
        journal: Journal,
    }

    #[async_trait::async_trait]
    impl Service for Parent {
        type Value = ();

        async fn start(&mut self, ctx: &mut ServiceStartContext) -> anyhow::Result<()> {
            self.journal.push("start:parent");
            let child = ServiceName::<String>::new("child");
            let _ = ctx
                .create_service(&child, Recorder::new("child", &self.journal))
                .install();
            Ok(())
        }

        async fn stop(&mut self, _ctx: &mut crate::ServiceStopContext) -> anyhow::Result<()> {
            self.journal.push("stop:parent");
            Ok(())
        }

        fn get(&self) -> Self::Value {}
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_nested_service() {
        let journal = Journal::default();
        let container = open_container();
        let parent = ServiceName::<()>::new("parent");

        container
            .create_service(&parent, Parent { journal: journal.clone() })
            .install()
            .await
            .expect("Failed to install");
        wait_for_state(&container, "child", Some(ServiceState::Started)).await;

        container.remove_service(&parent).await.expect("Failed to remove");
        assert!(!container.has_service("child").await.expect("Failed to query"));
        assert!(before(&journal, "stopped:child", "stop:parent"));

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_group_reference() {
        let journal = Journal::default();
        let container = open_container();
        let partitions = ServiceName::<String>::new("partitions");
        let registry = ServiceName::<String>::new("registry");
        let p1 = ServiceName::<String>::new("p1");
        let p2 = ServiceName::<String>::new("p2");
        let reference = GroupReference::<String>::new();

        container
            .create_service(&registry, Recorder::new("registry", &journal))
            .group_reference(&partitions, &reference)
            .install()
            .await
            .expect("Failed to install registry");
        for partition in [&p1, &p2] {
            container
                .create_service(partition, Recorder::new(partition.name(), &journal))
                .group(&partitions)
                .install()
                .await
                .expect("Failed to install partition");
        }

        while reference.len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(reference.values(), vec!["p1", "p2"]);

        container.remove_service(&p1).await.expect("Failed to remove");
        while reference.contains(&p1) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(reference.names(), vec![p2.clone()]);
        assert_eq!(
            container.service_state(&registry).await.expect("Failed to query"),
            Some(ServiceState::Started)
        );

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
        assert!(reference.is_empty());
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_close_in_dependency_order() {
        let journal = Journal::default();
        let container = open_container();
        let a = ServiceName::<String>::new("a");
        let b = ServiceName::<String>::new("b");
        let c = ServiceName::<String>::new("c");
        let d = ServiceName::<String>::new("d");

        let installed = [
            container
                .create_service(
                    &c,
                    Recorder::new("c", &journal).stop_delay(Duration::from_millis(5)),
                )
                .dependency(&b)
                .install(),
            container
                .create_service(&b, Recorder::new("b", &journal))
                .dependency(&a)
                .install(),
            container.create_service(&a, Recorder::new("a", &journal)).install(),
            container.create_service(&d, Recorder::new("d", &journal)).install(),
        ];
        for installed in installed {
            installed.await.expect("Failed to install");
        }

        let closed = container.close_async();
        assert_matches!(
            container
                .create_service(&ServiceName::new("late"), Recorder::new("late", &journal))
                .install()
                .await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::Closing, .. })
        );
        closed.await.expect("Failed to close");

        assert!(before(&journal, "stopped:c", "stop:b"));
        assert!(before(&journal, "stopped:b", "stop:a"));
        assert_eq!(journal.count("stopped:d"), 1);
        assert_eq!(journal.count("start:late"), 0);
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_close_dependency_cycle() {
        let journal = Journal::default();
        let container = open_container();
        let x = ServiceName::<String>::new("x");
        let y = ServiceName::<String>::new("y");

        let x_installed = container
            .create_service(&x, Recorder::new("x", &journal))
            .dependency(&y)
            .install();
        let y_installed = container
            .create_service(&y, Recorder::new("y", &journal))
            .dependency(&x)
            .install();

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
        assert_matches!(x_installed.await, Err(ServiceError::Interrupted(_)));
        assert_matches!(y_installed.await, Err(ServiceError::Interrupted(_)));
        assert!(journal.entries().is_empty());
    }

    #[tokio::test]
    #[rstest::rstest]
    #[timeout(std::time::Duration::from_secs(1))]
    async fn service_container_lifecycle() {
        let journal = Journal::default();
        let container = ServiceContainer::new();
        let a = ServiceName::<String>::new("a");

        assert_matches!(
            container.create_service(&a, Recorder::new("a", &journal)).install().await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::New, .. })
        );
        assert_matches!(
            container.close_async().await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::New, .. })
        );

        container.start().expect("Failed to start");
        assert_matches!(
            container.start(),
            Err(ServiceError::InvalidContainerState { state: ContainerState::Open, .. })
        );
        container
            .create_service(&a, Recorder::new("a", &journal))
            .install()
            .await
            .expect("Failed to install");

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
        assert_matches!(
            container.create_service(&a, Recorder::new("a", &journal)).install().await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::Closed, .. })
        );
        assert_matches!(
            container.remove_service(&a).await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::Closed, .. })
        );
        assert_matches!(
            container.close_async().await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::Closed, .. })
        );
        assert_eq!(journal.count("start:a"), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn service_container_close_timeout() {
        let journal = Journal::default();
        let container = open_container();
        let stuck = ServiceName::<String>::new("stuck");

        container
            .create_service(
                &stuck,
                Recorder::new("stuck", &journal).stop_delay(Duration::from_secs(3600)),
            )
            .install()
            .await
            .expect("Failed to install");

        assert_matches!(
            container.close(Duration::from_millis(50)).await,
            Err(ServiceError::CloseTimeout(_))
        );
        assert!(logs_contain("Unresolved services"));
        assert_matches!(
            container.has_service(&stuck).await,
            Err(ServiceError::InvalidContainerState { state: ContainerState::Closed, .. })
        );
        assert_matches!(
            container.start(),
            Err(ServiceError::InvalidContainerState { state: ContainerState::Closed, .. })
        );
        assert_eq!(journal.count("stopped:stuck"), 0);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn service_container_slow_start_warning() {
        let journal = Journal::default();
        let container = open_container();
        let slow = ServiceName::<String>::new("slow");
        let delay = crate::SERVICE_GRACE_PERIOD + Duration::from_secs(1);

        container
            .create_service(&slow, Recorder::new("slow", &journal).start_delay(delay, false))
            .install()
            .await
            .expect("Failed to install");

        assert!(logs_contain("Service slow has not completed its start"));
        assert_matches!(
            container.service_state(&slow).await,
            Ok(Some(ServiceState::Started))
        );
        assert_eq!(journal.entries(), ["start:slow", "started:slow"]);

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
    }

    type Graph = Vec<(BTreeSet<usize>, u64)>;

    async fn run_graph(nodes: &Graph, install_order: &[usize], removal_order: &[usize]) -> Journal {
        let journal = Journal::default();
        let container = open_container();
        let names = (0..nodes.len())
            .map(|i| ServiceName::<String>::new(i.to_string()))
            .collect::<Vec<_>>();

        let installed = install_order
            .iter()
            .map(|&i| {
                let (dependencies, delay) = &nodes[i];
                let recorder = Recorder::new(i.to_string(), &journal)
                    .start_delay(Duration::from_millis(*delay), false);
                dependencies
                    .iter()
                    .filter(|&&dependency| dependency < i)
                    .fold(container.create_service(&names[i], recorder), |builder, &dependency| {
                        builder.dependency(&names[dependency])
                    })
                    .install()
            })
            .collect::<Vec<_>>();
        for installed in installed {
            installed.await.expect("Failed to install");
        }

        let removed = removal_order
            .iter()
            .map(|&i| container.remove_service(&names[i]))
            .collect::<Vec<_>>();
        for removed in removed {
            removed.await.expect("Failed to remove");
        }

        container.close(CLOSE_TIMEOUT).await.expect("Failed to close");
        journal
    }

    fn graph() -> impl Strategy<Value = (Graph, Vec<usize>, Vec<usize>)> {
        prop::collection::vec((prop::collection::btree_set(0usize..8, 0..4), 0u64..4), 2..8)
            .prop_flat_map(|nodes| {
                let order = (0..nodes.len()).collect::<Vec<_>>();
                (
                    Just(nodes),
                    Just(order.clone()).prop_shuffle(),
                    Just(order).prop_shuffle(),
                )
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn service_container_dependency_order((nodes, install_order, removal_order) in graph()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("Failed to build runtime");
            let journal = runtime.block_on(run_graph(&nodes, &install_order, &removal_order));

            for (i, (dependencies, _)) in nodes.iter().enumerate() {
                prop_assert_eq!(journal.count(&format!("start:{i}")), 1);
                prop_assert_eq!(journal.count(&format!("stop:{i}")), 1);

                for dependency in dependencies.iter().filter(|&&dependency| dependency < i) {
                    let started_first =
                        before(&journal, &format!("started:{dependency}"), &format!("start:{i}"));
                    prop_assert!(started_first, "{} started before {}", dependency, i);
                    let stopped_first =
                        before(&journal, &format!("stopped:{i}"), &format!("stop:{dependency}"));
                    prop_assert!(stopped_first, "{} stopped before {}", i, dependency);
                }
            }
        }
    }
}
