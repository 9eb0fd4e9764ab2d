use crate::CqrsError;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Single-shot view mutation passed to [`ViewRepository::update_by_id`].
/// Receives the current row when one exists and returns the row to store.
pub type UpdateFn<V> = Box<dyn FnOnce(Option<V>) -> V + Send>;

/// Read-side storage for one projection's view rows, keyed by domain id.
///
/// Single-item operations are strongly consistent; the projection runtime
/// treats every failure as retryable.
#[async_trait::async_trait]
pub trait ViewRepository<V>: Debug + Send + Sync
where
    V: Debug + Clone + Send + Sync + 'static,
{
    async fn save(&self, id: &str, view: V) -> Result<(), CqrsError>;

    async fn update_by_id(&self, id: &str, update: UpdateFn<V>) -> Result<(), CqrsError>;

    async fn find(&self, id: &str) -> Result<Option<V>, CqrsError>;
}

pub type DynViewRepository<V> = Arc<dyn ViewRepository<V>>;

/// A simple in-memory view store, for tests and as the default.
#[derive(Debug)]
pub struct InMemoryViewRepository<V> {
    views: Arc<Mutex<HashMap<String, V>>>,
}

impl<V> InMemoryViewRepository<V>
where
    V: Debug + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            views: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Gets all views in the store.
    pub fn all(&self) -> HashMap<String, V> {
        self.views.lock().unwrap().clone()
    }

    /// Clears all views from the store.
    pub fn clear(&self) {
        self.views.lock().unwrap().clear();
    }
}

impl<V> Default for InMemoryViewRepository<V>
where
    V: Debug + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for InMemoryViewRepository<V> {
    fn clone(&self) -> Self {
        Self {
            views: self.views.clone(),
        }
    }
}

#[async_trait::async_trait]
impl<V> ViewRepository<V> for InMemoryViewRepository<V>
where
    V: Debug + Clone + Send + Sync + 'static,
{
    async fn save(&self, id: &str, view: V) -> Result<(), CqrsError> {
        self.views.lock().unwrap().insert(id.to_string(), view);
        Ok(())
    }

    async fn update_by_id(&self, id: &str, update: UpdateFn<V>) -> Result<(), CqrsError> {
        let mut views = self.views.lock().unwrap();
        let current = views.get(id).cloned();
        views.insert(id.to_string(), update(current));
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<V>, CqrsError> {
        Ok(self.views.lock().unwrap().get(id).cloned())
    }
}
