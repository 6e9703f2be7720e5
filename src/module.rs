use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::MessageBus;
use crate::store::EventStore;

/// Opaque error raised by a module during setup.
pub type SetupError = Box<dyn std::error::Error + Send + Sync>;

/// A module's setup failure, wrapped with the module identity.
#[derive(Debug, thiserror::Error)]
#[error("module {module} failed to register: {source}")]
pub struct ModuleError {
    pub module: &'static str,
    #[source]
    pub source: SetupError,
}

/// An independent unit wiring itself into the core at startup.
///
/// `register` is a module's sole contract: subscribe handlers to the bus and
/// optionally read or write the store during setup. Modules perform no
/// cross-module coordination; ordering between unrelated modules is
/// unspecified and must not be relied upon for correctness.
#[async_trait]
pub trait Module: Send + Sync {
    async fn register(
        &self,
        bus: &mut MessageBus,
        store: Arc<dyn EventStore>,
    ) -> Result<(), SetupError>;

    /// The name of the module, used in setup error reports. By default, the
    /// type name.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Registers each module in turn, stopping at the first setup failure.
pub async fn register_modules(
    bus: &mut MessageBus,
    store: Arc<dyn EventStore>,
    modules: &[Box<dyn Module>],
) -> Result<(), ModuleError> {
    for module in modules {
        module
            .register(bus, Arc::clone(&store))
            .await
            .map_err(|source| ModuleError {
                module: module.name(),
                source,
            })?;
    }
    Ok(())
}
