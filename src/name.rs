use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

/// An extensible type-safe wrapper around [`String`], used to identify a [`Service`][^1].
///
/// Operations which do not care about the value exposed by a service, such as
/// [`remove_service`] or [`has_service`], accept any [`ServiceId`].
///
/// [^1]: See also: [`ServiceName`]
///
/// [`Service`]: crate::Service
/// [`remove_service`]: crate::ServiceContainer::remove_service
/// [`has_service`]: crate::ServiceContainer::has_service
pub trait ServiceId {
    fn svc_id(&self) -> String;
}

impl ServiceId for &str {
    fn svc_id(&self) -> String {
        self.to_string()
    }
}

impl ServiceId for String {
    fn svc_id(&self) -> String {
        self.clone()
    }
}

/// The name of a [`Service`] exposing a value of type `T`.
///
/// Two names are equal if their identifiers are equal, regardless of `T`. The type parameter is
/// only used to check at compile time that an [`Injector`] or a [`GroupReference`] is bound to a
/// service exposing the right kind of value.
///
/// A [`ServiceName`] is also used as a _group tag_: services which join a group with
/// [`ServiceBuilder::group`] are handed to every [`GroupReference`] bound to that group.
///
/// [`Service`]: crate::Service
/// [`Injector`]: crate::Injector
/// [`GroupReference`]: crate::GroupReference
/// [`ServiceBuilder::group`]: crate::ServiceBuilder::group
pub struct ServiceName<T> {
    name: Arc<str>,
    _value: PhantomData<fn() -> T>,
}

impl<T> ServiceName<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for ServiceName<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _value: PhantomData,
        }
    }
}

impl<T> ServiceId for ServiceName<T> {
    fn svc_id(&self) -> String {
        self.name.to_string()
    }
}

impl<T> ServiceId for &ServiceName<T> {
    fn svc_id(&self) -> String {
        self.name.to_string()
    }
}

impl<T> fmt::Debug for ServiceName<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceName").field(&self.name).finish()
    }
}

impl<T> fmt::Display for ServiceName<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl<T> PartialEq for ServiceName<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for ServiceName<T> {}

impl<T> PartialOrd for ServiceName<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ServiceName<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl<T> Hash for ServiceName<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}
