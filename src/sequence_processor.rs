use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::ack::AcknowledgementEngine;
use crate::collaborators::SignedElement;
use crate::context::RmContext;
use crate::dispatch::{send_fault, BackChannel, InvocationResponse};
use crate::fault::{RmError, RmFault};
use crate::registry::MAX_MESSAGE_NUMBER;
use crate::store::records::InvocationTask;
use crate::wsrm::message::{RmBody, RmMessage};


/// Inbound application messages of a receiving sequence: duplicate detection, recording the
///  message number for acknowledgement, and delivery - either right away or through the
///  in-order invoker.
pub struct SequenceProcessor {
    ctx: Arc<RmContext>,
    ack: Arc<AcknowledgementEngine>,
}

impl SequenceProcessor {
    pub fn new(ctx: Arc<RmContext>, ack: Arc<AcknowledgementEngine>) -> SequenceProcessor {
        SequenceProcessor { ctx, ack }
    }

    pub async fn process_application(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let Some(header) = &message.headers.sequence else {
            return Err(RmError::Internal(anyhow::anyhow!("message {} has no sequence header", message.message_id)));
        };
        let sequence_id = header.identifier.as_str();
        let message_number = header.message_number;

        let sequence = match self.ctx.registry.receiving(sequence_id)? {
            Some(s) if !s.is_terminated() => s,
            _ => {
                debug!("message #{} for unknown sequence {}", message_number, sequence_id);
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(sequence_id)).await);
            }
        };

        self.ctx.verify_token(&sequence.security_token, SignedElement::SequenceHeader, message)?;
        self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

        let guard = self.ctx.registry.lock_receiving(sequence_id).await;
        let Some(mut sequence) = self.ctx.registry.receiving(sequence_id)? else {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(sequence_id)).await);
        };

        if message_number == 0 {
            // a protocol violation the sequence does not recover from
            warn!("message {} on {} has message number 0 - terminating the sequence", message.message_id, sequence_id);
            self.ctx.registry.cleanup_receiving(sequence_id, Instant::now())?;
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::sequence_terminated(sequence_id, "message numbers start at 1")).await);
        }
        if message_number > MAX_MESSAGE_NUMBER {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::message_number_rollover(sequence_id, message_number)).await);
        }

        let now = Instant::now();
        if sequence.received.contains(message_number) {
            // the peer did not get our ack, so it needs another one
            debug!("dropping duplicate message #{} on {}", message_number, sequence_id);
            self.ack.generate_ack(sequence_id, false, Some(back_channel), now)?;
            return Ok(InvocationResponse::Abort);
        }

        if sequence.closed {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::sequence_closed(sequence_id)).await);
        }
        if let Some(last) = sequence.last_message_number {
            if message_number > last {
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::last_message_number_exceeded(sequence_id, message_number, last)).await);
            }
        }

        // a message is acknowledged only once it is stored for invocation
        let invocation = if self.ctx.config.invoke_in_order {
            let message_key = self.ctx.storage.store_message(message.clone())?;
            let task = InvocationTask {
                message_key,
                sequence_id: sequence_id.to_string(),
                message_number,
            };
            if let Err(e) = self.ctx.storage.invocation_tasks.insert(task.clone()) {
                self.discard_invocation(&task);
                return Err(e.into());
            }
            Some(task)
        }
        else {
            None
        };

        sequence.received.insert(message_number);
        if message_number > sequence.highest_message_number {
            sequence.highest_message_number = message_number;
            sequence.highest_message_id = Some(message.message_id.clone());
        }
        if header.last_message {
            sequence.last_message_number = Some(message_number);
            sequence.last_message_id = Some(message.message_id.clone());
        }
        sequence.last_activity = now;
        if let Err(e) = self.ctx.registry.update_receiving(sequence) {
            if let Some(task) = &invocation {
                self.discard_invocation(task);
            }
            return Err(e.into());
        }
        trace!("received message #{} on {}", message_number, sequence_id);

        self.ack.generate_ack(sequence_id, false, Some(back_channel), now)?;

        if invocation.is_some() {
            drop(guard);
            self.ctx.invoker_wakeup.notify_one();
            return Ok(InvocationResponse::Suspend);
        }

        drop(guard);
        if let RmBody::Application(payload) = &message.body {
            self.ctx.listener.on_sequence_message(sequence_id, message_number, payload.clone()).await;
        }
        Ok(InvocationResponse::Continue)
    }

    /// rolls back an invocation task of a message that could not be recorded
    fn discard_invocation(&self, task: &InvocationTask) {
        if let Err(e) = self.ctx.storage.invocation_tasks.delete(&task.message_key) {
            warn!("failed to discard invocation task for message #{} of {}: {}", task.message_number, task.sequence_id, e);
        }
        if let Err(e) = self.ctx.storage.remove_message(&task.message_key) {
            warn!("failed to discard stored message #{} of {}: {}", task.message_number, task.sequence_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;
    use crate::collaborators::{ApplicationListener, MockApplicationListener, NoSecurity};
    use crate::fault::FaultKind;
    use crate::registry::tests::receiving_sequence;
    use crate::store::in_memory::tests::InstrumentedTable;
    use crate::store::records::TaskKind;
    use crate::store::StorageManager;
    use crate::test_util::listener::RecordingListener;
    use crate::test_util::{test_config, test_context_with_listener};
    use crate::test_util::transport::TrackingTransport;
    use crate::wsrm::elements::SequenceHeader;
    use crate::wsrm::spec_version::SpecVersion;

    fn setup(in_order: bool) -> (Arc<RmContext>, Arc<RecordingListener>, SequenceProcessor) {
        let listener = Arc::new(RecordingListener::default());
        let mut ctx = test_context_with_listener(Arc::new(TrackingTransport::new()), listener.clone());
        let mut config = (*ctx.config).clone();
        config.invoke_in_order = in_order;
        ctx.config = Arc::new(config);

        let ctx = Arc::new(ctx);
        ctx.registry.insert_receiving(receiving_sequence("r")).unwrap();
        let ack = Arc::new(AcknowledgementEngine::new(ctx.clone()));
        (ctx.clone(), listener, SequenceProcessor::new(ctx, ack))
    }

    fn app_message(sequence_id: &str, message_number: u64, last: bool) -> RmMessage {
        let mut message = RmMessage::new(SpecVersion::V1_1, RmBody::Application(Bytes::from(format!("msg {}", message_number))));
        message.headers.sequence = Some(SequenceHeader {
            identifier: sequence_id.to_string(),
            message_number,
            last_message: last,
        });
        message
    }

    fn fault_kind(back_channel: &mut BackChannel) -> Option<FaultKind> {
        match back_channel.take_response().map(|m| m.body) {
            Some(RmBody::Fault(fault)) => Some(fault.kind),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_unordered_delivery() {
        let (ctx, listener, processor) = setup(false);

        for n in [2, 1, 3] {
            let result = processor.process_application(&app_message("r", n, false), &mut BackChannel::none()).await.unwrap();
            assert_eq!(result, InvocationResponse::Continue);
        }
        assert_eq!(listener.message_numbers("r"), vec![2, 1, 3]);

        let seq = ctx.registry.receiving("r").unwrap().unwrap();
        assert!(seq.received.complete_up_to(3));
        assert_eq!(seq.highest_message_number, 3);
    }

    #[tokio::test]
    async fn test_in_order_suspends() {
        let (ctx, listener, processor) = setup(true);

        let result = processor.process_application(&app_message("r", 2, false), &mut BackChannel::none()).await.unwrap();
        assert_eq!(result, InvocationResponse::Suspend);
        assert!(listener.messages().is_empty());

        let tasks = ctx.storage.invocation_tasks.find(&|_| true).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].message_number, 2);
    }

    #[tokio::test]
    async fn test_duplicate_is_dropped_and_acked() {
        let (ctx, listener, processor) = setup(false);
        processor.process_application(&app_message("r", 1, false), &mut BackChannel::none()).await.unwrap();

        let result = processor.process_application(&app_message("r", 1, false), &mut BackChannel::none()).await.unwrap();
        assert_eq!(result, InvocationResponse::Abort);
        assert_eq!(listener.message_numbers("r"), vec![1]);
        assert_eq!(ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack).unwrap().len(), 1);
    }

    #[rstest]
    #[case::unknown("other", 1, None, false, Some(FaultKind::UnknownSequence))]
    #[case::closed("r", 1, None, true, Some(FaultKind::SequenceClosed))]
    #[case::beyond_last("r", 4, Some(3), false, Some(FaultKind::LastMessageNumberExceeded))]
    #[case::rollover("r", MAX_MESSAGE_NUMBER + 1, None, false, Some(FaultKind::MessageNumberRollover))]
    #[case::zero("r", 0, None, false, Some(FaultKind::SequenceTerminated))]
    #[tokio::test]
    async fn test_rejected(#[case] sequence_id: &str, #[case] message_number: u64, #[case] last: Option<u64>, #[case] closed: bool, #[case] expected: Option<FaultKind>) {
        let (ctx, listener, processor) = setup(false);
        ctx.storage.receiving.modify(&"r".to_string(), &mut |s| {
            s.last_message_number = last;
            s.closed = closed;
        }).unwrap();

        let mut back_channel = BackChannel::available();
        let result = processor.process_application(&app_message(sequence_id, message_number, false), &mut back_channel).await.unwrap();
        assert_eq!(result, InvocationResponse::Abort);
        assert_eq!(fault_kind(&mut back_channel), expected);
        assert!(listener.messages().is_empty());
        assert!(ctx.registry.receiving("r").unwrap().unwrap().received.is_empty());
    }

    #[tokio::test]
    async fn test_last_message_marker() {
        let (ctx, _, processor) = setup(false);
        processor.process_application(&app_message("r", 2, true), &mut BackChannel::none()).await.unwrap();

        let seq = ctx.registry.receiving("r").unwrap().unwrap();
        assert_eq!(seq.last_message_number, Some(2));

        let mut back_channel = BackChannel::available();
        processor.process_application(&app_message("r", 3, false), &mut back_channel).await.unwrap();
        assert_eq!(fault_kind(&mut back_channel), Some(FaultKind::LastMessageNumberExceeded));
    }

    #[tokio::test]
    async fn test_message_number_zero_terminates_sequence() {
        let (ctx, listener, processor) = setup(false);

        let mut back_channel = BackChannel::available();
        processor.process_application(&app_message("r", 0, false), &mut back_channel).await.unwrap();
        assert_eq!(fault_kind(&mut back_channel), Some(FaultKind::SequenceTerminated));
        assert!(ctx.registry.receiving("r").unwrap().unwrap().is_terminated());

        let mut back_channel = BackChannel::available();
        processor.process_application(&app_message("r", 1, false), &mut back_channel).await.unwrap();
        assert_eq!(fault_kind(&mut back_channel), Some(FaultKind::UnknownSequence));
        assert!(listener.messages().is_empty());
    }

    fn context_with_storage(storage: StorageManager, listener: Arc<dyn ApplicationListener>, in_order: bool) -> (Arc<RmContext>, SequenceProcessor) {
        let mut config = test_config();
        config.invoke_in_order = in_order;
        let ctx = Arc::new(RmContext::new(Arc::new(config), Arc::new(storage), Arc::new(TrackingTransport::new()), Arc::new(NoSecurity {}), listener));
        ctx.registry.insert_receiving(receiving_sequence("r")).unwrap();
        let ack = Arc::new(AcknowledgementEngine::new(ctx.clone()));
        (ctx.clone(), SequenceProcessor::new(ctx, ack))
    }

    #[tokio::test]
    async fn test_message_is_not_acked_if_it_can_not_be_stored() {
        let invocation_tasks = Arc::new(InstrumentedTable::<InvocationTask>::default());
        let mut storage = StorageManager::in_memory();
        storage.invocation_tasks = invocation_tasks.clone();
        let (ctx, processor) = context_with_storage(storage, Arc::new(RecordingListener::default()), true);

        invocation_tasks.set_failing_inserts(true);
        let mut back_channel = BackChannel::available();
        assert!(processor.process_application(&app_message("r", 1, false), &mut back_channel).await.is_err());

        assert!(ctx.registry.receiving("r").unwrap().unwrap().received.is_empty());
        assert!(back_channel.response().is_none());
        assert!(ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack).unwrap().is_empty());
        assert!(ctx.storage.messages.find(&|_| true).unwrap().is_empty());

        // the peer re-sends the message since it was never acknowledged
        invocation_tasks.set_failing_inserts(false);
        let result = processor.process_application(&app_message("r", 1, false), &mut BackChannel::available()).await.unwrap();
        assert_eq!(result, InvocationResponse::Suspend);
        assert!(ctx.registry.receiving("r").unwrap().unwrap().received.contains(1));
        assert_eq!(ctx.storage.invocation_tasks.find(&|_| true).unwrap().len(), 1);
        assert_eq!(ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listener_gets_each_message_once() {
        let mut listener = MockApplicationListener::new();
        listener.expect_on_sequence_message()
            .once()
            .withf(|sequence_id, message_number, payload| sequence_id == "r" && *message_number == 1 && payload == &Bytes::from("msg 1"))
            .return_const(());
        listener.expect_on_sequence_fault().never();
        let (_, processor) = context_with_storage(StorageManager::in_memory(), Arc::new(listener), false);

        assert_eq!(processor.process_application(&app_message("r", 1, false), &mut BackChannel::none()).await.unwrap(), InvocationResponse::Continue);
        assert_eq!(processor.process_application(&app_message("r", 1, false), &mut BackChannel::none()).await.unwrap(), InvocationResponse::Abort);
    }
}
