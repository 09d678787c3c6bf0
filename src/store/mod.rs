//! The persistent store contract. The engine keeps all protocol state in a [StorageManager] and
//!  treats it as the single source of truth - in-memory state is never authoritative, which is
//!  what makes a restart with a durable store implementation recoverable.
//!
//! The contract is deliberately small: keyed records with atomic insert / update / delete,
//!  an atomic read-modify-write, and predicate based find. Serialization of concurrent work on
//!  a single sequence is done by [crate::registry::SequenceLocks], not by the store.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

use crate::store::in_memory::InMemoryTable;
use crate::store::records::{InvocationTask, ReceivingSequence, SendTask, SendingSequence, StoredMessage};
use crate::wsrm::message::RmMessage;

pub mod in_memory;
pub mod records;


pub trait Record: Clone + Debug + Send + Sync + 'static {
    type Key: Clone + Debug + Eq + Hash + Send + Sync;

    fn key(&self) -> Self::Key;
}

/// A table of records of one type. All operations are atomic with regard to each other.
pub trait Table<R: Record>: Send + Sync {
    /// fails if a record with the same key exists
    fn insert(&self, record: R) -> anyhow::Result<()>;

    fn get(&self, key: &R::Key) -> anyhow::Result<Option<R>>;

    /// replaces an existing record, failing if there is none
    fn update(&self, record: R) -> anyhow::Result<()>;

    /// returns the removed record, `None` if there was none - deleting a record twice is not
    ///  an error
    fn delete(&self, key: &R::Key) -> anyhow::Result<Option<R>>;

    fn find(&self, predicate: &dyn Fn(&R) -> bool) -> anyhow::Result<Vec<R>>;

    /// atomically applies `f` to the record with the given key, returning the modified record,
    ///  or `None` if there is no such record
    fn modify(&self, key: &R::Key, f: &mut dyn FnMut(&mut R)) -> anyhow::Result<Option<R>>;
}

/// Handle to all tables the engine uses. It is constructed explicitly and passed to the engine,
///  its lifetime is bound to the engine's.
pub struct StorageManager {
    pub sending: Arc<dyn Table<SendingSequence>>,
    pub receiving: Arc<dyn Table<ReceivingSequence>>,
    pub send_tasks: Arc<dyn Table<SendTask>>,
    pub invocation_tasks: Arc<dyn Table<InvocationTask>>,
    pub messages: Arc<dyn Table<StoredMessage>>,
}

impl StorageManager {
    pub fn in_memory() -> StorageManager {
        StorageManager {
            sending: Arc::new(InMemoryTable::default()),
            receiving: Arc::new(InMemoryTable::default()),
            send_tasks: Arc::new(InMemoryTable::default()),
            invocation_tasks: Arc::new(InMemoryTable::default()),
            messages: Arc::new(InMemoryTable::default()),
        }
    }

    /// stores a message, returning the key to reference it
    pub fn store_message(&self, message: RmMessage) -> anyhow::Result<String> {
        let key = uuid::Uuid::new_v4().to_string();
        trace!("storing message {} under key {}", message.message_id, key);
        self.messages.insert(StoredMessage {
            key: key.clone(),
            message,
        })?;
        Ok(key)
    }

    pub fn retrieve_message(&self, key: &str) -> anyhow::Result<Option<RmMessage>> {
        Ok(self.messages.get(&key.to_string())?
            .map(|stored| stored.message))
    }

    pub fn remove_message(&self, key: &str) -> anyhow::Result<()> {
        self.messages.delete(&key.to_string())?;
        Ok(())
    }

    /// deletes a send task together with its stored message. Deleting a task that is gone
    ///  already is a no-op.
    pub fn delete_send_task(&self, message_id: &str) -> anyhow::Result<Option<SendTask>> {
        let removed = self.send_tasks.delete(&message_id.to_string())?;
        if let Some(task) = &removed {
            if let Some(key) = &task.message_key {
                self.remove_message(key)?;
            }
        }
        Ok(removed)
    }
}
