//! Entity store - persisted state behind an injectable seam
//!
//! The engine reads and writes documents, chunks, workers and tasks only
//! through `EntityStore`. `InMemoryStore` keeps everything in process and is
//! not durable; a deployment backs the trait with an external store.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Document;
use crate::swarm::{Chunk, Task, Worker};

/// Something stored under a string id
pub trait Entity: Clone + Send + Sync + 'static {
    fn entity_id(&self) -> &str;
}

impl Entity for Document {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for Chunk {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for Worker {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl Entity for Task {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

pub trait EntityStore<T: Entity>: Send + Sync {
    fn get(&self, id: &str) -> Option<T>;

    /// Insert or replace
    fn set(&self, value: T);

    fn remove(&self, id: &str) -> Option<T>;

    /// Ids in first-insertion order
    fn ids(&self) -> Vec<String>;

    /// Read-modify-write under the store's lock. Returns false if `id` is absent.
    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> bool;

    fn len(&self) -> usize {
        self.ids().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn list(&self) -> Vec<T> {
        self.ids().iter().filter_map(|id| self.get(id)).collect()
    }
}

struct Slots<T> {
    items: HashMap<String, T>,
    order: Vec<String>,
}

/// In-process store guarded by a `parking_lot::RwLock`
pub struct InMemoryStore<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                items: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> EntityStore<T> for InMemoryStore<T> {
    fn get(&self, id: &str) -> Option<T> {
        self.slots.read().items.get(id).cloned()
    }

    fn set(&self, value: T) {
        let mut slots = self.slots.write();
        let id = value.entity_id().to_string();
        if slots.items.insert(id.clone(), value).is_none() {
            slots.order.push(id);
        }
    }

    fn remove(&self, id: &str) -> Option<T> {
        let mut slots = self.slots.write();
        let removed = slots.items.remove(id);
        if removed.is_some() {
            slots.order.retain(|existing| existing != id);
        }
        removed
    }

    fn ids(&self) -> Vec<String> {
        self.slots.read().order.clone()
    }

    fn update(&self, id: &str, f: &mut dyn FnMut(&mut T)) -> bool {
        let mut slots = self.slots.write();
        match slots.items.get_mut(id) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.slots.read().items.len()
    }
}

/// One store per entity kind
#[derive(Clone)]
pub struct PipelineStore {
    pub documents: Arc<dyn EntityStore<Document>>,
    pub chunks: Arc<dyn EntityStore<Chunk>>,
    pub workers: Arc<dyn EntityStore<Worker>>,
    pub tasks: Arc<dyn EntityStore<Task>>,
}

impl PipelineStore {
    pub fn in_memory() -> Self {
        Self {
            documents: Arc::new(InMemoryStore::<Document>::new()),
            chunks: Arc::new(InMemoryStore::<Chunk>::new()),
            workers: Arc::new(InMemoryStore::<Worker>::new()),
            tasks: Arc::new(InMemoryStore::<Task>::new()),
        }
    }
}

impl Default for PipelineStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::WorkerSpec;

    fn worker(id: &str) -> Worker {
        Worker::from_spec(id.into(), WorkerSpec::new(id, &["text"], 1))
    }

    #[test]
    fn test_set_keeps_first_insertion_order() {
        let store = InMemoryStore::new();
        store.set(worker("b"));
        store.set(worker("a"));
        store.set(worker("b"));
        assert_eq!(store.ids(), vec!["b", "a"]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_update_and_remove() {
        let store = InMemoryStore::new();
        store.set(worker("w"));
        assert!(store.update("w", &mut |w: &mut Worker| w.current_load = 1));
        assert_eq!(store.get("w").unwrap().current_load, 1);
        assert!(!store.update("missing", &mut |_: &mut Worker| {}));

        assert!(store.remove("w").is_some());
        assert!(store.is_empty());
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_pipeline_store_is_shared_across_clones() {
        let store = PipelineStore::in_memory();
        let clone = store.clone();
        clone.workers.set(worker("w"));
        assert_eq!(store.workers.len(), 1);
    }
}
