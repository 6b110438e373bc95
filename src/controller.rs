use std::{any::Any, fmt, mem, ops::ControlFlow, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    SERVICE_GRACE_PERIOD, Service, ServiceError, ServiceId, ServiceStartContext,
    ServiceStopContext,
    builder::ServiceDescriptor,
    container::ContainerHandle,
    future::Completer,
    injector::ServiceValue,
    resolver::Registration,
    service::Completion,
};

/// Where a [`Service`] currently stands in its lifecycle.
///
/// A service always moves forward through these states: once it has left [`Started`] it will
/// never be started again, it needs to be installed anew.
///
/// [`Started`]: Self::Started
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServiceState {
    /// Installed, waiting for every dependency to be started.
    AwaitDependenciesStarted,
    /// `start` was invoked and has not completed yet. If the service was asked to stop in the
    /// meantime, it will do so as soon as it has started.
    AwaitStart { stop_after_started: bool },
    Started,
    /// Asked to stop, waiting for every dependent service to be removed.
    AwaitDependentsStopped,
    /// `stop` was invoked and has not completed yet.
    AwaitStop,
    Removed,
}

impl ServiceState {
    fn same_phase(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EventKind {
    DependenciesAvailable,
    DependenciesUnavailable,
    DependentsStopped,
    Stopping,
    Started,
    StartFailed,
    Stopped,
    Removed,
}

/// Lifecycle events, processed by a controller strictly in the order they were received.
pub(crate) enum ServiceEvent {
    DependenciesAvailable(Vec<(String, ServiceValue)>),
    DependenciesUnavailable,
    DependentsStopped,
    Stopping,
    Started,
    StartFailed(anyhow::Error),
    Stopped,
    Removed,
}

impl ServiceEvent {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Self::DependenciesAvailable(_) => EventKind::DependenciesAvailable,
            Self::DependenciesUnavailable => EventKind::DependenciesUnavailable,
            Self::DependentsStopped => EventKind::DependentsStopped,
            Self::Stopping => EventKind::Stopping,
            Self::Started => EventKind::Started,
            Self::StartFailed(_) => EventKind::StartFailed,
            Self::Stopped => EventKind::Stopped,
            Self::Removed => EventKind::Removed,
        }
    }
}

impl fmt::Debug for ServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DependenciesAvailable(dependencies) => f
                .debug_tuple("DependenciesAvailable")
                .field(&dependencies.iter().map(|(name, _)| name).collect::<Vec<_>>())
                .finish(),
            Self::StartFailed(error) => f.debug_tuple("StartFailed").field(error).finish(),
            other => fmt::Debug::fmt(&other.kind(), f),
        }
    }
}

/// Changes in the membership of a group a controller holds a reference to. These do not affect the
/// lifecycle of the controller.
#[derive(Debug)]
pub(crate) enum ReferenceUpdate {
    Added {
        group: String,
        name: String,
        value: ServiceValue,
    },
    Removed {
        group: String,
        name: String,
    },
}

#[derive(Debug)]
pub(crate) enum ControllerMessage {
    Lifecycle(ServiceEvent),
    Reference(ReferenceUpdate),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum StartAbort {
    Interrupted,
    RemovedWhileStarting,
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Effect {
    /// Injects the dependencies carried by the event and invokes [`Service::start`].
    InjectAndStart,
    CompleteStart,
    FailStart(StartAbort),
    InvokeStop { interrupted: bool },
    EmitStopped,
    EmitRemoved,
    ReleaseInjected,
    Terminate,
}

/// The lifecycle of a service controller, as data.
///
/// Returns the next state and the effects the controller has to carry out, in order, or [`None`] if
/// `event` is meaningless in `state` and should be ignored. `interruptible` tells whether a pending
/// asynchronous start may be interrupted.
pub(crate) fn transition(
    state: ServiceState,
    event: EventKind,
    interruptible: bool,
) -> Option<(ServiceState, Vec<Effect>)> {
    use EventKind as E;
    use ServiceState as S;

    let next = match (state, event) {
        (S::AwaitDependenciesStarted, E::DependenciesAvailable) => (
            S::AwaitStart {
                stop_after_started: false,
            },
            vec![Effect::InjectAndStart],
        ),
        (S::AwaitDependenciesStarted, E::DependenciesUnavailable | E::Stopping) => (
            S::Removed,
            vec![
                Effect::FailStart(StartAbort::Interrupted),
                Effect::EmitRemoved,
            ],
        ),
        (
            S::AwaitStart {
                stop_after_started: false,
            },
            E::Started,
        ) => (S::Started, vec![Effect::CompleteStart]),
        (
            S::AwaitStart {
                stop_after_started: true,
            },
            E::Started,
        ) => (
            S::AwaitStop,
            vec![
                Effect::FailStart(StartAbort::RemovedWhileStarting),
                Effect::InvokeStop { interrupted: false },
            ],
        ),
        // The service is assumed not to hold any resource if it failed to start, so it is not
        // stopped
        (S::AwaitStart { .. }, E::StartFailed) => (
            S::AwaitStop,
            vec![Effect::FailStart(StartAbort::Failed), Effect::EmitStopped],
        ),
        (S::AwaitStart { .. }, E::DependenciesUnavailable | E::DependentsStopped | E::Stopping) => {
            if interruptible {
                (
                    S::AwaitStop,
                    vec![
                        Effect::FailStart(StartAbort::Interrupted),
                        Effect::InvokeStop { interrupted: true },
                    ],
                )
            } else {
                (
                    S::AwaitStart {
                        stop_after_started: true,
                    },
                    vec![],
                )
            }
        }
        (S::Started, E::DependenciesUnavailable | E::Stopping) => {
            (S::AwaitDependentsStopped, vec![])
        }
        (S::AwaitDependentsStopped, E::DependentsStopped) => (
            S::AwaitStop,
            vec![Effect::InvokeStop { interrupted: false }],
        ),
        (S::AwaitStop, E::Stopped) => (
            S::Removed,
            vec![Effect::ReleaseInjected, Effect::EmitRemoved],
        ),
        (S::Removed, E::Removed) => (S::Removed, vec![Effect::Terminate]),
        _ => return None,
    };

    Some(next)
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Start,
    Stop,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Everything a controller needs from the container to run.
pub(crate) struct Launch {
    pub(crate) sx: mpsc::UnboundedSender<ControllerMessage>,
    pub(crate) rx: mpsc::UnboundedReceiver<ControllerMessage>,
    pub(crate) container: ContainerHandle,
    pub(crate) token: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

/// A service which was submitted to the container but has not been accepted yet.
pub(crate) trait Installable: Send {
    fn registration(&self) -> Registration;
    fn reject(self: Box<Self>, error: ServiceError);
    fn launch(self: Box<Self>, launch: Launch);
}

pub(crate) struct PendingService<S: Service> {
    descriptor: ServiceDescriptor<S>,
    start: Completer<S::Value>,
}

impl<S: Service> PendingService<S> {
    pub(crate) fn new(descriptor: ServiceDescriptor<S>, start: Completer<S::Value>) -> Self {
        Self { descriptor, start }
    }
}

impl<S: Service> Installable for PendingService<S> {
    fn registration(&self) -> Registration {
        Registration {
            name: self.descriptor.name.svc_id(),
            dependencies: self.descriptor.dependencies.iter().cloned().collect(),
            group: self.descriptor.group.clone(),
            references: self.descriptor.references.keys().cloned().collect(),
        }
    }

    fn reject(self: Box<Self>, error: ServiceError) {
        tracing::error!("Failed to install service {}: {error}", self.descriptor.name);
        let _ = self.start.send(Err(error));
    }

    fn launch(self: Box<Self>, launch: Launch) {
        let Self { descriptor, start } = *self;
        let Launch {
            sx,
            rx,
            container,
            token,
            tracker,
        } = launch;

        let span = tracing::debug_span!("service", name = %descriptor.name);
        let controller = ServiceController {
            descriptor,
            state: ServiceState::AwaitDependenciesStarted,
            start: Some(start),
            start_interruptible: false,
            pending: None,
            resolved: Vec::new(),
            sx,
            rx,
            container,
            token,
            tracker: tracker.clone(),
        };

        tracker.spawn(controller.run().instrument(span));
    }
}

/// Drives a single [`Service`] through its lifecycle.
///
/// Each controller is its own actor: it owns its service and only ever reacts to the messages it
/// receives from the container, from the tasks it spawned, or from itself.
struct ServiceController<S: Service> {
    descriptor: ServiceDescriptor<S>,
    state: ServiceState,
    start: Option<Completer<S::Value>>,
    start_interruptible: bool,
    /// Cancels the asynchronous start or stop currently pending, if any.
    pending: Option<CancellationToken>,
    resolved: Vec<String>,
    sx: mpsc::UnboundedSender<ControllerMessage>,
    rx: mpsc::UnboundedReceiver<ControllerMessage>,
    container: ContainerHandle,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl<S: Service> ServiceController<S> {
    fn name(&self) -> &str {
        self.descriptor.name.name()
    }

    async fn run(mut self) {
        tracing::debug!("Service {} is awaiting its dependencies", self.name());

        loop {
            let message = tokio::select! {
                message = self.rx.recv() => message,
                _ = self.token.cancelled() => None,
            };

            match message {
                Some(ControllerMessage::Lifecycle(event)) => {
                    if self.on_event(event).await.is_break() {
                        break;
                    }
                }
                Some(ControllerMessage::Reference(update)) => self.on_reference(update),
                None => {
                    tracing::warn!(
                        "⚠️  Service {} was cancelled in state {:?}",
                        self.name(),
                        self.state
                    );
                    break;
                }
            }
        }
    }

    async fn on_event(&mut self, event: ServiceEvent) -> ControlFlow<()> {
        let kind = event.kind();
        let Some((next, effects)) = transition(self.state, kind, self.start_interruptible) else {
            tracing::debug!("Ignoring event {kind:?} in state {:?}", self.state);
            return ControlFlow::Continue(());
        };

        let previous = mem::replace(&mut self.state, next);
        let mut event = Some(event);
        let mut exposed = None;

        for effect in effects {
            match effect {
                Effect::InjectAndStart => self.inject_and_start(event.take()).await,
                Effect::CompleteStart => exposed = Some(self.complete_start()),
                Effect::FailStart(abort) => self.fail_start(abort, event.take()),
                Effect::InvokeStop { interrupted } => self.invoke_stop(interrupted).await,
                Effect::EmitStopped => self.emit(ServiceEvent::Stopped),
                Effect::EmitRemoved => self.emit(ServiceEvent::Removed),
                Effect::ReleaseInjected => self.release_injected(),
                Effect::Terminate => return ControlFlow::Break(()),
            }
        }

        if !previous.same_phase(&next) {
            self.container.state_changed(self.name(), next, exposed);
        }

        ControlFlow::Continue(())
    }

    fn on_reference(&self, update: ReferenceUpdate) {
        match update {
            ReferenceUpdate::Added { group, name, value } => {
                if let Some(reference) = self.descriptor.references.get(&group) {
                    if let Err(expected) = reference.add(&name, &value) {
                        tracing::error!(
                            "Member {name} of group {group} does not expose a value of type {expected}"
                        );
                    }
                }
            }
            ReferenceUpdate::Removed { group, name } => {
                if let Some(reference) = self.descriptor.references.get(&group) {
                    reference.remove(&name);
                }
            }
        }
    }

    fn emit(&self, event: ServiceEvent) {
        // Our own receiver lives as long as we do
        let _ = self.sx.send(ControllerMessage::Lifecycle(event));
    }

    async fn inject_and_start(&mut self, event: Option<ServiceEvent>) {
        let Some(ServiceEvent::DependenciesAvailable(dependencies)) = event else {
            return;
        };

        if let Err(error) = self.inject(dependencies) {
            self.emit(ServiceEvent::StartFailed(error.into()));
            return;
        }

        tracing::debug!("Starting service {}", self.name());
        let mut ctx = ServiceStartContext::new(self.name(), self.container.clone());
        let started = AssertUnwindSafe(self.descriptor.service.start(&mut ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked(Phase::Start, panic)));
        match started {
            Ok(()) => match ctx.into_completion() {
                (None, _) => self.emit(ServiceEvent::Started),
                (Some(completion), interruptible) => {
                    self.start_interruptible = interruptible;
                    self.await_completion(completion, Phase::Start);
                }
            },
            Err(error) => self.emit(ServiceEvent::StartFailed(error)),
        }
    }

    fn inject(&mut self, dependencies: Vec<(String, ServiceValue)>) -> Result<(), ServiceError> {
        self.resolved = dependencies.iter().map(|(name, _)| name.clone()).collect();

        for (dependency, value) in &dependencies {
            for injector in self.descriptor.injectors.get(dependency).into_iter().flatten() {
                injector
                    .inject(dependency, value)
                    .map_err(|expected| ServiceError::TypeMismatch {
                        name: self.name().to_string(),
                        dependency: dependency.clone(),
                        expected,
                    })?;
            }
        }

        Ok(())
    }

    fn complete_start(&mut self) -> ServiceValue {
        tracing::debug!("Service {} has started", self.name());
        let value = self.descriptor.service.get();
        if let Some(start) = self.start.take() {
            let _ = start.send(Ok(value.clone()));
        }
        Arc::new(value)
    }

    fn fail_start(&mut self, abort: StartAbort, event: Option<ServiceEvent>) {
        let name = self.name().to_string();
        let error = match (abort, event) {
            (StartAbort::Failed, Some(ServiceEvent::StartFailed(source))) => {
                tracing::error!("Service {name} failed to start: {source:#}");
                ServiceError::StartFailure { name, source }
            }
            (StartAbort::RemovedWhileStarting, _) => {
                tracing::debug!("Service {name} was removed while starting");
                ServiceError::RemovedWhileStarting(name)
            }
            _ => {
                tracing::debug!("Service {name} was interrupted before it could start");
                ServiceError::Interrupted(name)
            }
        };

        if let Some(start) = self.start.take() {
            let _ = start.send(Err(error));
        }
    }

    async fn invoke_stop(&mut self, interrupted: bool) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }

        tracing::debug!("Stopping service {}", self.name());
        let mut ctx = ServiceStopContext::new(self.name(), self.container.clone(), interrupted);
        let stopped = AssertUnwindSafe(self.descriptor.service.stop(&mut ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panicked(Phase::Stop, panic)));
        match stopped {
            Ok(()) => match ctx.into_completion() {
                None => self.emit(ServiceEvent::Stopped),
                Some(completion) => self.await_completion(completion, Phase::Stop),
            },
            Err(source) => {
                log_stop_failure(self.name(), source);
                self.emit(ServiceEvent::Stopped);
            }
        }
    }

    /// Waits for an asynchronous start or stop on a separate task, so that this controller keeps
    /// receiving events in the meantime. The outcome is sent back as a regular event.
    fn await_completion(&mut self, completion: Completion, phase: Phase) {
        let mut task = match completion {
            Completion::Future(future) => self.tracker.spawn(future),
            Completion::Blocking(action) => self.tracker.spawn_blocking(action),
        };

        let token = self.token.child_token();
        let name = self.name().to_string();
        let sx = self.sx.clone();
        self.pending = Some(token.clone());

        let watcher = async move {
            let joined = tokio::select! {
                joined = &mut task => joined,
                _ = token.cancelled() => {
                    task.abort();
                    return;
                }
                _ = tokio::time::sleep(SERVICE_GRACE_PERIOD) => {
                    tracing::warn!(
                        "⚠️  Service {name} has not completed its {phase} after {SERVICE_GRACE_PERIOD:?}"
                    );
                    tokio::select! {
                        joined = &mut task => joined,
                        _ = token.cancelled() => {
                            task.abort();
                            return;
                        }
                    }
                }
            };

            let result = joined
                .map_err(|e| anyhow::anyhow!("Asynchronous {phase} did not run to completion: {e}"))
                .and_then(|res| res);

            let event = match (phase, result) {
                (Phase::Start, Ok(())) => ServiceEvent::Started,
                (Phase::Start, Err(error)) => ServiceEvent::StartFailed(error),
                (Phase::Stop, Ok(())) => ServiceEvent::Stopped,
                (Phase::Stop, Err(source)) => {
                    log_stop_failure(&name, source);
                    ServiceEvent::Stopped
                }
            };
            let _ = sx.send(ControllerMessage::Lifecycle(event));
        };
        self.tracker.spawn(watcher.in_current_span());
    }

    fn release_injected(&mut self) {
        for dependency in mem::take(&mut self.resolved) {
            for injector in self.descriptor.injectors.get(&dependency).into_iter().flatten() {
                injector.uninject();
            }
        }
        for reference in self.descriptor.references.values() {
            reference.clear();
        }
    }
}

fn panicked(phase: Phase, panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    anyhow::anyhow!("{phase} panicked: {message}")
}

fn log_stop_failure(name: &str, source: anyhow::Error) {
    let error = ServiceError::StopFailure {
        name: name.to_string(),
        source,
    };
    tracing::error!("{:#}", anyhow::Error::new(error));
}
