mod builder;
mod composite;
mod container;
mod controller;
mod error;
mod future;
mod injector;
mod name;
mod resolver;
mod service;
#[cfg(test)]
mod testing;

pub use builder::ServiceBuilder;
pub use composite::CompositeServiceBuilder;
pub use container::ServiceContainer;
pub use controller::ServiceState;
pub use error::{ContainerState, ServiceError};
pub use future::ServiceFuture;
pub use injector::{GroupReference, Injector};
pub use name::{ServiceId, ServiceName};
pub use service::*;

/// Read-only wrapper for data which must not change once a service is installed.
#[repr(transparent)]
struct Frozen<T>(T);

impl<T> std::ops::Deref for Frozen<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

trait Freeze<T>
where
    Self: Sized,
{
    fn freeze(self) -> Frozen<T>;
}

impl<T: Sized> Freeze<T> for T {
    fn freeze(self) -> Frozen<T> {
        Frozen(self)
    }
}
