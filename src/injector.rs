use std::{any::Any, fmt, sync::Arc};

use dashmap::DashMap;
use itertools::Itertools;
use tokio::sync::watch;

use crate::ServiceName;

/// The value exposed by a started service, as it travels between actors.
pub(crate) type ServiceValue = Arc<dyn Any + Send + Sync>;

/// Type-erased side of an [`Injector`], as stored in a service descriptor.
pub(crate) trait Inject: Send + Sync {
    /// Fails with the name of the expected type if `value` is not of that type.
    fn inject(&self, from: &str, value: &ServiceValue) -> Result<(), &'static str>;
    fn uninject(&self);
}

/// Type-erased side of a [`GroupReference`], as stored in a service descriptor.
pub(crate) trait Reference: Send + Sync {
    fn add(&self, name: &str, value: &ServiceValue) -> Result<(), &'static str>;
    fn remove(&self, name: &str);
    fn clear(&self);
}

struct Injected<T> {
    from: String,
    value: T,
}

/// Receives the value exposed by a dependency.
///
/// An [`Injector`] is bound to a single dependency with [`ServiceBuilder::inject`]. It holds the
/// dependency's value from the moment all dependencies of the service are available (just before
/// [`Service::start`] is called) until the service has finished stopping. It never holds the value
/// of a dependency which has not been started.
///
/// Injectors are cheap to clone: clones share the same cell, so a service typically keeps a clone
/// around and reads from it during and after `start`.
///
/// [`ServiceBuilder::inject`]: crate::ServiceBuilder::inject
/// [`Service::start`]: crate::Service::start
pub struct Injector<T> {
    cell: Arc<watch::Sender<Option<Injected<T>>>>,
}

impl<T> Clone for Injector<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Default for Injector<T> {
    fn default() -> Self {
        Self {
            cell: Arc::new(watch::Sender::new(None)),
        }
    }
}

impl<T> fmt::Debug for Injector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("injected", &self.injected_name())
            .finish()
    }
}

impl<T> Injector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_injected(&self) -> bool {
        self.cell.borrow().is_some()
    }

    /// The name of the service whose value is currently injected.
    pub fn injected_name(&self) -> Option<String> {
        self.cell.borrow().as_ref().map(|injected| injected.from.clone())
    }
}

impl<T: Clone> Injector<T> {
    pub fn get(&self) -> Option<T> {
        self.cell
            .borrow()
            .as_ref()
            .map(|injected| injected.value.clone())
    }
}

impl<T> Inject for Injector<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn inject(&self, from: &str, value: &ServiceValue) -> Result<(), &'static str> {
        let value = value
            .downcast_ref::<T>()
            .ok_or(std::any::type_name::<T>())?;
        self.cell.send_replace(Some(Injected {
            from: from.to_string(),
            value: value.clone(),
        }));
        Ok(())
    }

    fn uninject(&self) {
        self.cell.send_replace(None);
    }
}

type Handler<T> = Box<dyn Fn(&ServiceName<T>, &T) + Send + Sync>;

struct GroupInner<T> {
    members: DashMap<String, T>,
    on_add: Option<Handler<T>>,
    on_remove: Option<Handler<T>>,
}

/// A dynamic, multi-valued dependency over every service of a group.
///
/// Services join a group with [`ServiceBuilder::group`]. A [`GroupReference`] bound to that group
/// with [`ServiceBuilder::group_reference`] receives every member which is started, and loses it
/// again as soon as the member starts to stop. Unlike a regular dependency, group members never
/// block the lifecycle of the service referencing them: members can come and go at any time.
///
/// Optional handlers can be registered with [`with_handlers`], they are invoked from the actor of the
/// service holding the reference.
///
/// [`ServiceBuilder::group`]: crate::ServiceBuilder::group
/// [`ServiceBuilder::group_reference`]: crate::ServiceBuilder::group_reference
/// [`with_handlers`]: Self::with_handlers
pub struct GroupReference<T> {
    inner: Arc<GroupInner<T>>,
}

impl<T> Clone for GroupReference<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for GroupReference<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                members: DashMap::new(),
                on_add: None,
                on_remove: None,
            }),
        }
    }
}

impl<T> GroupReference<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handlers(
        on_add: impl Fn(&ServiceName<T>, &T) + Send + Sync + 'static,
        on_remove: impl Fn(&ServiceName<T>, &T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                members: DashMap::new(),
                on_add: Some(Box::new(on_add)),
                on_remove: Some(Box::new(on_remove)),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    pub fn contains(&self, name: &ServiceName<T>) -> bool {
        self.inner.members.contains_key(name.name())
    }

    /// Names of the current members, sorted.
    pub fn names(&self) -> Vec<ServiceName<T>> {
        self.inner
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .sorted()
            .map(ServiceName::new)
            .collect()
    }
}

impl<T: Clone> GroupReference<T> {
    pub fn get(&self, name: &ServiceName<T>) -> Option<T> {
        self.inner
            .members
            .get(name.name())
            .map(|entry| entry.value().clone())
    }

    /// Values of the current members, ordered by member name.
    pub fn values(&self) -> Vec<T> {
        self.inner
            .members
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, value)| value)
            .collect()
    }
}

impl<T> Reference for GroupReference<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn add(&self, name: &str, value: &ServiceValue) -> Result<(), &'static str> {
        let value = value
            .downcast_ref::<T>()
            .ok_or(std::any::type_name::<T>())?;
        self.inner.members.insert(name.to_string(), value.clone());
        if let Some(on_add) = &self.inner.on_add {
            on_add(&ServiceName::new(name), value);
        }
        Ok(())
    }

    fn remove(&self, name: &str) {
        // Handlers are called outside of the map's shard lock
        let removed = self.inner.members.remove(name);
        if let (Some((name, value)), Some(on_remove)) = (removed, &self.inner.on_remove) {
            on_remove(&ServiceName::new(name), &value);
        }
    }

    fn clear(&self) {
        self.inner.members.clear();
    }
}
