use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use itertools::Itertools;
use tokio::sync::mpsc;

use crate::{
    Freeze, Frozen, ServiceState,
    controller::{ControllerMessage, ReferenceUpdate, ServiceEvent},
    injector::ServiceValue,
};

/// What the resolver needs to know about a service being installed.
#[derive(Debug)]
pub(crate) struct Registration {
    pub(crate) name: String,
    pub(crate) dependencies: BTreeSet<String>,
    pub(crate) group: Option<String>,
    pub(crate) references: BTreeSet<String>,
}

#[derive(Clone, Debug)]
pub(crate) struct ControllerHandle(mpsc::UnboundedSender<ControllerMessage>);

impl ControllerHandle {
    pub(crate) fn new(sx: mpsc::UnboundedSender<ControllerMessage>) -> Self {
        Self(sx)
    }

    fn send(&self, event: ServiceEvent) {
        // A controller which has terminated has already been unregistered, or is about to be
        let _ = self.0.send(ControllerMessage::Lifecycle(event));
    }

    fn update(&self, update: ReferenceUpdate) {
        let _ = self.0.send(ControllerMessage::Reference(update));
    }
}

struct ServiceNode {
    controller: ControllerHandle,
    dependencies: Frozen<BTreeSet<String>>,
    group: Option<String>,
    references: Frozen<BTreeSet<String>>,
    state: ServiceState,
    /// Exposed value, only set while the service is started and not stopping.
    value: Option<ServiceValue>,
    /// Whether dependencies were delivered to the controller.
    resolved: bool,
    stopping: bool,
    /// Dependents which still have to be removed before this service can stop. Set once the
    /// service starts stopping and cleared once they are all gone.
    draining: Option<BTreeSet<String>>,
}

/// The dependency graph of every installed service.
///
/// The resolver is owned by the container actor and decides which lifecycle events each controller
/// receives, based on the state changes they report:
///
/// - A service receives its dependencies exactly once, when they are all started and none of them
///   is stopping.
/// - When a service starts stopping, each of its installed dependents is told its dependencies are
///   no longer available, and the service itself is only told its dependents are stopped once all
///   of those have been removed.
///
/// Dependencies are tracked by name: a service can depend on a service which is not installed yet,
/// in which case it simply waits.
#[derive(Default)]
pub(crate) struct DependencyResolver {
    nodes: BTreeMap<String, ServiceNode>,
    /// Reverse edges, indexed by the name of the dependency whether it is installed or not.
    dependents: BTreeMap<String, BTreeSet<String>>,
    groups: BTreeMap<String, BTreeSet<String>>,
    referrers: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyResolver {
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn state(&self, name: &str) -> Option<ServiceState> {
        self.nodes.get(name).map(|node| node.state)
    }

    /// Adds a service to the graph. Its name must not be taken.
    pub(crate) fn register(&mut self, registration: Registration, controller: ControllerHandle) {
        let Registration {
            name,
            dependencies,
            group,
            references,
        } = registration;

        for dependency in &dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(name.clone());
        }
        if let Some(group) = &group {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(name.clone());
        }
        for group in &references {
            self.referrers
                .entry(group.clone())
                .or_default()
                .insert(name.clone());
            for (member, value) in self.started_members(group) {
                controller.update(ReferenceUpdate::Added {
                    group: group.clone(),
                    name: member,
                    value,
                });
            }
        }

        self.nodes.insert(
            name.clone(),
            ServiceNode {
                controller,
                dependencies: dependencies.freeze(),
                group,
                references: references.freeze(),
                state: ServiceState::AwaitDependenciesStarted,
                value: None,
                resolved: false,
                stopping: false,
                draining: None,
            },
        );

        self.resolve(&name);
    }

    /// Asks a service to stop. Returns `false` if no such service is installed.
    pub(crate) fn request_removal(&mut self, name: &str) -> bool {
        let Some(node) = self.nodes.get(name) else {
            return false;
        };

        node.controller.send(ServiceEvent::Stopping);
        self.begin_stopping(name);
        true
    }

    /// Updates the graph after a controller reported a change of state.
    pub(crate) fn on_state_changed(
        &mut self,
        name: &str,
        state: ServiceState,
        value: Option<ServiceValue>,
    ) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        node.state = state;

        match state {
            ServiceState::Started => self.on_started(name, value),
            ServiceState::AwaitDependentsStopped | ServiceState::AwaitStop => {
                self.begin_stopping(name)
            }
            ServiceState::Removed => {
                self.begin_stopping(name);
                self.unregister(name);
            }
            ServiceState::AwaitDependenciesStarted | ServiceState::AwaitStart { .. } => {}
        }
    }

    fn on_started(&mut self, name: &str, value: Option<ServiceValue>) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        // Removal was requested before the start was reported
        if node.stopping {
            return;
        }
        let Some(value) = value else {
            return;
        };
        node.value = Some(Arc::clone(&value));
        let group = node.group.clone();

        for dependent in self.dependents_of(name) {
            self.resolve(&dependent);
        }

        if let Some(group) = group {
            for referrer in self.referrers_of(&group) {
                if let Some(node) = self.nodes.get(&referrer) {
                    node.controller.update(ReferenceUpdate::Added {
                        group: group.clone(),
                        name: name.to_string(),
                        value: Arc::clone(&value),
                    });
                }
            }
        }
    }

    /// Delivers its dependencies to a service if they are all available.
    fn resolve(&mut self, name: &str) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        if node.resolved || node.stopping {
            return;
        }

        let available = node
            .dependencies
            .iter()
            .map(|dependency| {
                self.exposed(dependency)
                    .map(|value| (dependency.clone(), Arc::clone(value)))
            })
            .collect::<Option<Vec<_>>>();
        let Some(available) = available else {
            return;
        };

        node.controller
            .send(ServiceEvent::DependenciesAvailable(available));
        if let Some(node) = self.nodes.get_mut(name) {
            node.resolved = true;
        }
    }

    /// Marks a service as stopping. Only the first call for a given service has any effect.
    fn begin_stopping(&mut self, name: &str) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if node.stopping {
            return;
        }
        node.stopping = true;
        let value = node.value.take();
        let group = node.group.clone();

        if let (Some(_), Some(group)) = (value, group) {
            for referrer in self.referrers_of(&group) {
                if let Some(node) = self.nodes.get(&referrer) {
                    node.controller.update(ReferenceUpdate::Removed {
                        group: group.clone(),
                        name: name.to_string(),
                    });
                }
            }
        }

        let dependents = self.dependents_of(name);
        for dependent in &dependents {
            if let Some(node) = self.nodes.get(dependent) {
                node.controller.send(ServiceEvent::DependenciesUnavailable);
            }
        }

        if let Some(node) = self.nodes.get_mut(name) {
            node.draining = Some(dependents.into_iter().collect());
        }
        self.release_if_drained(name);
    }

    fn release_if_drained(&mut self, name: &str) {
        let Some(node) = self.nodes.get_mut(name) else {
            return;
        };
        if node.draining.as_ref().is_some_and(BTreeSet::is_empty) {
            node.draining = None;
            node.controller.send(ServiceEvent::DependentsStopped);
        }
    }

    fn unregister(&mut self, name: &str) {
        let Some(node) = self.nodes.remove(name) else {
            return;
        };

        for dependency in node.dependencies.iter() {
            let orphaned = self.dependents.get_mut(dependency).is_some_and(|dependents| {
                dependents.remove(name);
                dependents.is_empty()
            });
            if orphaned {
                self.dependents.remove(dependency);
            }

            if let Some(draining) = self
                .nodes
                .get_mut(dependency)
                .and_then(|node| node.draining.as_mut())
            {
                draining.remove(name);
            }
            self.release_if_drained(dependency);
        }

        if let Some(group) = &node.group {
            remove_from(&mut self.groups, group, name);
        }
        for group in node.references.iter() {
            remove_from(&mut self.referrers, group, name);
        }
    }

    /// Services from which an orderly shutdown of the whole graph starts: those with no installed
    /// dependency, along with those still waiting on their dependencies (which might never come,
    /// for example in a cycle).
    pub(crate) fn roots(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| {
                node.state == ServiceState::AwaitDependenciesStarted
                    || !node
                        .dependencies
                        .iter()
                        .any(|dependency| self.nodes.contains_key(dependency))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// A human readable view of every installed service and the state of its dependencies.
    pub(crate) fn dump(&self) -> String {
        self.nodes
            .iter()
            .map(|(name, node)| {
                let dependencies = node
                    .dependencies
                    .iter()
                    .map(|dependency| match self.nodes.get(dependency) {
                        Some(dependency_node) => {
                            format!("\n    -- {dependency} in {:?}", dependency_node.state)
                        }
                        None => format!("\n    -- {dependency} (not installed)"),
                    })
                    .join("");
                format!("{name} in {:?}{dependencies}", node.state)
            })
            .join("\n")
    }

    fn exposed(&self, name: &str) -> Option<&ServiceValue> {
        self.nodes
            .get(name)
            .filter(|node| !node.stopping)
            .and_then(|node| node.value.as_ref())
    }

    fn dependents_of(&self, name: &str) -> Vec<String> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .filter(|dependent| self.nodes.contains_key(*dependent))
            .cloned()
            .collect()
    }

    fn referrers_of(&self, group: &str) -> Vec<String> {
        self.referrers
            .get(group)
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn started_members(&self, group: &str) -> Vec<(String, ServiceValue)> {
        self.groups
            .get(group)
            .into_iter()
            .flatten()
            .filter_map(|member| {
                self.exposed(member)
                    .map(|value| (member.clone(), Arc::clone(value)))
            })
            .collect()
    }
}

fn remove_from(index: &mut BTreeMap<String, BTreeSet<String>>, key: &str, name: &str) {
    let emptied = index.get_mut(key).is_some_and(|names| {
        names.remove(name);
        names.is_empty()
    });
    if emptied {
        index.remove(key);
    }
}
