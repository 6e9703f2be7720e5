use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::saga::{SagaId, SagaInstance};

/// Opaque error raised by a saga log backend.
pub type SagaLogError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence seam for saga checkpoints.
///
/// The coordinator writes a checkpoint synchronously after every state
/// transition, so an implementation over durable storage gives crash
/// recovery through [`SagaCoordinator::resume`](crate::saga::SagaCoordinator::resume).
#[async_trait]
pub trait SagaLog: Send + Sync {
    /// Persists the instance, replacing any previous checkpoint for its id.
    async fn persist(&self, instance: &SagaInstance) -> Result<(), SagaLogError>;

    /// Loads the last checkpoint for `id`, if any.
    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>, SagaLogError>;

    /// Removes the checkpoint for `id`. Removing an unknown id is not an
    /// error.
    async fn remove(&self, id: SagaId) -> Result<(), SagaLogError>;
}

/// In-process implementation of the [`SagaLog`], keeping checkpoints in
/// memory. Cloneable with shared contents, like
/// [`InMemoryStore`](crate::store::memory::InMemoryStore).
#[derive(Clone, Default)]
pub struct InMemorySagaLog {
    instances: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
}

impl InMemorySagaLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaLog for InMemorySagaLog {
    async fn persist(&self, instance: &SagaInstance) -> Result<(), SagaLogError> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load(&self, id: SagaId) -> Result<Option<SagaInstance>, SagaLogError> {
        let instances = self.instances.read().unwrap_or_else(PoisonError::into_inner);
        Ok(instances.get(&id).cloned())
    }

    async fn remove(&self, id: SagaId) -> Result<(), SagaLogError> {
        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        instances.remove(&id);
        Ok(())
    }
}
