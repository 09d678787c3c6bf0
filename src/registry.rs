use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::fault::RmError;
use crate::store::records::{ReceivingSequence, SendTask, SendingSequence, SequenceState, TaskKind};
use crate::store::StorageManager;
use crate::wsrm::elements::SequenceHeader;
use crate::wsrm::message::{RmBody, RmMessage};

/// the largest message number a sequence may use (xs:long)
pub const MAX_MESSAGE_NUMBER: u64 = i64::MAX as u64;

/// One async lock per sequence. All work that reads and then changes a sequence's state holds
///  the sequence's lock for the duration, so concurrent processing of the same sequence is
///  serialized while different sequences proceed in parallel.
///
/// NB: The locks are not reentrant - code that is called with a lock held must not acquire it
///      again.
#[derive(Default)]
pub struct SequenceLocks {
    locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SequenceLocks {
    pub async fn lock(&self, sequence_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().unwrap()
            .entry(sequence_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// drops the lock for a sequence that is gone for good
    pub fn forget(&self, sequence_id: &str) {
        self.locks.lock().unwrap()
            .remove(sequence_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// The sequence records and their locks. Sending sequences are addressed by their internal id,
///  receiving sequences by their wire id.
pub struct SequenceRegistry {
    storage: Arc<StorageManager>,
    sending_locks: SequenceLocks,
    receiving_locks: SequenceLocks,
}

impl SequenceRegistry {
    pub fn new(storage: Arc<StorageManager>) -> SequenceRegistry {
        SequenceRegistry {
            storage,
            sending_locks: Default::default(),
            receiving_locks: Default::default(),
        }
    }

    pub async fn lock_sending(&self, internal_id: &str) -> OwnedMutexGuard<()> {
        self.sending_locks.lock(internal_id).await
    }

    pub async fn lock_receiving(&self, wire_id: &str) -> OwnedMutexGuard<()> {
        self.receiving_locks.lock(wire_id).await
    }

    /// acquires the lock of the sequence a task belongs to
    pub async fn lock_for_task(&self, task: &SendTask) -> OwnedMutexGuard<()> {
        match task.kind {
            TaskKind::Ack | TaskKind::MakeConnection | TaskKind::MakeConnectionResponse => self.lock_receiving(&task.sequence_ref).await,
            _ => self.lock_sending(&task.sequence_ref).await,
        }
    }

    pub fn sending(&self, internal_id: &str) -> anyhow::Result<Option<SendingSequence>> {
        self.storage.sending.get(&internal_id.to_string())
    }

    pub fn sending_by_wire_id(&self, wire_id: &str) -> anyhow::Result<Option<SendingSequence>> {
        Ok(self.storage.sending.find(&|s| s.wire_id.as_deref() == Some(wire_id))?
            .into_iter()
            .next())
    }

    pub fn sending_by_create_message_id(&self, message_id: &str) -> anyhow::Result<Option<SendingSequence>> {
        Ok(self.storage.sending.find(&|s| s.create_sequence_message_id.as_deref() == Some(message_id))?
            .into_iter()
            .next())
    }

    pub fn receiving(&self, wire_id: &str) -> anyhow::Result<Option<ReceivingSequence>> {
        self.storage.receiving.get(&wire_id.to_string())
    }

    pub fn insert_sending(&self, sequence: SendingSequence) -> Result<(), RmError> {
        if self.sending(&sequence.internal_id)?.is_some() {
            return Err(RmError::SequenceExists(sequence.internal_id));
        }
        debug!("registering sending sequence {}", sequence.internal_id);
        self.storage.sending.insert(sequence)?;
        Ok(())
    }

    pub fn insert_receiving(&self, sequence: ReceivingSequence) -> Result<(), RmError> {
        if self.receiving(&sequence.wire_id)?.is_some() {
            return Err(RmError::SequenceExists(sequence.wire_id));
        }
        debug!("registering receiving sequence {}", sequence.wire_id);
        self.storage.receiving.insert(sequence)?;
        Ok(())
    }

    pub fn update_sending(&self, sequence: SendingSequence) -> anyhow::Result<()> {
        self.storage.sending.update(sequence)
    }

    pub fn update_receiving(&self, sequence: ReceivingSequence) -> anyhow::Result<()> {
        self.storage.receiving.update(sequence)
    }

    /// true if any sequence on either side uses the wire id
    pub fn is_wire_id_in_use(&self, wire_id: &str) -> anyhow::Result<bool> {
        Ok(self.receiving(wire_id)?.is_some() || self.sending_by_wire_id(wire_id)?.is_some())
    }

    /// All send tasks of a sending sequence, optionally filtered by kind
    pub fn sending_tasks(&self, internal_id: &str, kind: Option<TaskKind>) -> anyhow::Result<Vec<SendTask>> {
        self.storage.send_tasks.find(&|t| t.sequence_ref == internal_id
            && !matches!(t.kind, TaskKind::Ack | TaskKind::MakeConnection | TaskKind::MakeConnectionResponse)
            && kind.map(|k| k == t.kind).unwrap_or(true))
    }

    /// Assigns the next message number to an outbound application message, stores the message
    ///  and adds its send task. This is atomic per sequence: concurrent callers get distinct,
    ///  gap free numbers.
    ///
    /// The task is not eligible for sending until the sequence is established.
    pub async fn allocate_message(&self, internal_id: &str, payload: Bytes, last_message: bool, now: Instant) -> Result<u64, RmError> {
        let _guard = self.lock_sending(internal_id).await;

        let Some(mut sequence) = self.sending(internal_id)? else {
            return Err(RmError::UnknownSequence(internal_id.to_string()));
        };
        if sequence.is_terminated() {
            return Err(RmError::SequenceTerminated(internal_id.to_string()));
        }
        if sequence.last_message_number.is_some() {
            return Err(RmError::LastMessageNumberExceeded(internal_id.to_string()));
        }
        if sequence.is_closed() || !sequence.state.accepts_messages() {
            return Err(RmError::SequenceClosed(internal_id.to_string()));
        }

        let message_number = sequence.highest_message_number + 1;
        if message_number > MAX_MESSAGE_NUMBER {
            return Err(RmError::MessageNumberRollover(internal_id.to_string()));
        }

        let mut message = RmMessage::new(sequence.version, RmBody::Application(payload))
            .with_to(sequence.destination.clone())
            .with_reply_to(sequence.reply_to.clone());
        // the identifier is filled in at send time, it is not known before the sequence is
        //  established
        message.headers.sequence = Some(SequenceHeader {
            identifier: sequence.wire_id.clone().unwrap_or_default(),
            message_number,
            last_message: last_message && !sequence.version.supports_close(),
        });
        message.security_token = sequence.security_token.clone();

        let mut task = SendTask::new(TaskKind::Application, internal_id, sequence.destination.clone(), now);
        task.message_id = message.message_id.clone();
        task.message_number = Some(message_number);
        task.send = sequence.wire_id.is_some();
        task.message_key = Some(self.storage.store_message(message)?);
        self.storage.send_tasks.insert(task)?;

        sequence.highest_message_number = message_number;
        if last_message {
            sequence.last_message_number = Some(message_number);
        }
        sequence.last_activity = now;
        self.update_sending(sequence)?;

        trace!("allocated message #{} on sequence {}", message_number, internal_id);
        Ok(message_number)
    }

    /// Marks a sending sequence as terminated and drops everything that is still scheduled for
    ///  it. The record itself stays until the removal timeout expires, returning the application
    ///  tasks that were still pending.
    ///
    /// NB: The caller must hold the sequence's lock
    pub fn cleanup_sending(&self, internal_id: &str, now: Instant) -> anyhow::Result<Vec<SendTask>> {
        let mut pending = Vec::new();
        for task in self.sending_tasks(internal_id, None)? {
            if let Some(task) = self.storage.delete_send_task(&task.message_id)? {
                if task.kind == TaskKind::Application {
                    pending.push(task);
                }
            }
        }
        pending.sort_by_key(|t| t.message_number);

        self.storage.sending.modify(&internal_id.to_string(), &mut |s| {
            s.state = SequenceState::Terminated;
            s.terminated_at.get_or_insert(now);
        })?;
        debug!("sending sequence {} is terminated, {} messages were still pending", internal_id, pending.len());
        Ok(pending)
    }

    /// Marks a receiving sequence as terminated and drops acks or polls still scheduled for it.
    ///  Messages waiting for in-order delivery stay, they are still handed to the application.
    ///
    /// NB: The caller must hold the sequence's lock
    pub fn cleanup_receiving(&self, wire_id: &str, now: Instant) -> anyhow::Result<()> {
        for task in self.storage.send_tasks.find(&|t| t.sequence_ref == wire_id && matches!(t.kind, TaskKind::Ack | TaskKind::MakeConnection))? {
            self.storage.delete_send_task(&task.message_id)?;
        }
        self.storage.receiving.modify(&wire_id.to_string(), &mut |s| {
            s.state = SequenceState::Terminated;
            s.terminated_at.get_or_insert(now);
        })?;
        debug!("receiving sequence {} is terminated", wire_id);
        Ok(())
    }

    /// removes a terminated sending sequence for good
    pub fn remove_sending(&self, internal_id: &str) -> anyhow::Result<()> {
        for task in self.sending_tasks(internal_id, None)? {
            self.storage.delete_send_task(&task.message_id)?;
        }
        self.storage.sending.delete(&internal_id.to_string())?;
        self.sending_locks.forget(internal_id);
        debug!("removed sending sequence {}", internal_id);
        Ok(())
    }

    /// removes a terminated receiving sequence for good, including messages that were never
    ///  delivered
    pub fn remove_receiving(&self, wire_id: &str) -> anyhow::Result<()> {
        for task in self.storage.send_tasks.find(&|t| t.sequence_ref == wire_id && matches!(t.kind, TaskKind::Ack | TaskKind::MakeConnection | TaskKind::MakeConnectionResponse))? {
            self.storage.delete_send_task(&task.message_id)?;
        }
        for task in self.storage.invocation_tasks.find(&|t| t.sequence_id == wire_id)? {
            self.storage.invocation_tasks.delete(&task.message_key)?;
            self.storage.remove_message(&task.message_key)?;
        }
        self.storage.receiving.delete(&wire_id.to_string())?;
        self.receiving_locks.forget(wire_id);
        debug!("removed receiving sequence {}", wire_id);
        Ok(())
    }
}
