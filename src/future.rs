use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::ServiceError;

/// Completes a [`ServiceFuture`] from inside an actor.
pub(crate) type Completer<T> = oneshot::Sender<Result<T, ServiceError>>;

/// The result of a request made to a [`ServiceContainer`].
///
/// Requests are enqueued as soon as they are made, so a [`ServiceFuture`] does not need to be
/// polled for the operation to take place: it can be dropped if the result is not needed.
///
/// If the actor responsible for completing the future goes away before doing so (for example after
/// a container was forcefully closed), the future resolves to [`ServiceError::Abandoned`].
///
/// [`ServiceContainer`]: crate::ServiceContainer
#[must_use = "requests are sent eagerly, but their result is only observable by awaiting them"]
pub struct ServiceFuture<T> {
    rx: oneshot::Receiver<Result<T, ServiceError>>,
}

impl<T> ServiceFuture<T> {
    pub(crate) fn pending() -> (Completer<T>, Self) {
        let (sx, rx) = oneshot::channel();
        (sx, Self { rx })
    }
}

impl<T> Future for ServiceFuture<T> {
    type Output = Result<T, ServiceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(ServiceError::Abandoned)))
    }
}
