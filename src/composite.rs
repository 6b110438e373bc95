use std::collections::BTreeSet;

use crate::{
    Service, ServiceBuilder, ServiceFuture, ServiceId, ServiceName, ServiceStopContext,
    container::ContainerHandle,
};

/// Groups a set of child services into a single unit which can be depended on, and removed, as a
/// whole.
struct CompositeService {
    children: Vec<String>,
}

#[async_trait::async_trait]
impl Service for CompositeService {
    type Value = ();

    async fn stop(&mut self, ctx: &mut ServiceStopContext) -> anyhow::Result<()> {
        for child in &self.children {
            // Children are removed in the background, they no longer have any dependent
            let _ = ctx.remove_service(child.as_str());
        }
        Ok(())
    }

    fn get(&self) -> Self::Value {}
}

/// Declares a composite service: a unit which only starts once all of its children have started,
/// and which removes its children when it is removed.
///
/// Children are created through [`create_service`] and installed individually, usually under a
/// name derived from the composite's own with [`join_name`].
///
/// [`create_service`]: Self::create_service
/// [`join_name`]: Self::join_name
pub struct CompositeServiceBuilder {
    name: ServiceName<()>,
    container: ContainerHandle,
    dependencies: BTreeSet<String>,
    children: BTreeSet<String>,
}

impl CompositeServiceBuilder {
    pub(crate) fn new(name: &ServiceName<()>, container: ContainerHandle) -> Self {
        Self {
            name: name.clone(),
            container,
            dependencies: BTreeSet::new(),
            children: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &ServiceName<()> {
        &self.name
    }

    /// Declares an additional dependency of the composite, which is not one of its children.
    pub fn dependency(mut self, id: impl ServiceId) -> Self {
        self.dependencies.insert(id.svc_id());
        self
    }

    /// Derives the name of a child from the name of this composite, as `<composite>.<child>`.
    pub fn join_name<T>(&self, child: &str) -> ServiceName<T> {
        ServiceName::new(format!("{}.{child}", self.name))
    }

    /// Declares a new child of this composite. The child still needs to be installed.
    pub fn create_service<S: Service>(
        &mut self,
        name: &ServiceName<S::Value>,
        service: S,
    ) -> ServiceBuilder<S> {
        self.children.insert(name.svc_id());
        ServiceBuilder::new(name, service, self.container.clone())
    }

    /// Installs the composite itself. The returned future resolves once every child has started.
    pub fn install(self) -> ServiceFuture<()> {
        let Self {
            name,
            container,
            dependencies,
            children,
        } = self;

        let composite = CompositeService {
            children: children.iter().cloned().collect(),
        };
        dependencies
            .into_iter()
            .chain(children)
            .fold(
                ServiceBuilder::new(&name, composite, container),
                |builder, dependency| builder.dependency(dependency),
            )
            .install()
    }
}
