use std::{fmt, time::Duration};

/// The lifecycle of a [`ServiceContainer`].
///
/// A container is not reusable: once it is [`Closed`] it will reject any further request.
///
/// [`ServiceContainer`]: crate::ServiceContainer
/// [`Closed`]: Self::Closed
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ContainerState {
    #[default]
    New,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::New => "new",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(state)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Cannot install service with name '{0}', a service with the same name already exists")]
    NamingConflict(String),
    #[error("Cannot {operation}, container is '{state}'")]
    InvalidContainerState {
        operation: &'static str,
        state: ContainerState,
    },
    #[error("Service {0} was interrupted")]
    Interrupted(String),
    #[error("Could not start service {0}, removed while starting")]
    RemovedWhileStarting(String),
    #[error("Service {name} failed to start")]
    StartFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Service {name} failed to stop")]
    StopFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Dependency {dependency} of service {name} does not expose a value of type {expected}")]
    TypeMismatch {
        name: String,
        dependency: String,
        expected: &'static str,
    },
    #[error("Context is already async, cannot request asynchronous completion more than once")]
    AlreadyAsync,
    #[error("Service container did not close within {0:?}")]
    CloseTimeout(Duration),
    #[error("Operation was abandoned before it could complete")]
    Abandoned,
}

impl ServiceError {
    pub(crate) fn invalid_state(operation: &'static str, state: ContainerState) -> Self {
        Self::InvalidContainerState { operation, state }
    }
}
