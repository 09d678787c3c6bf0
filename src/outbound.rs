//! Turning send tasks into wire messages. Acknowledgement state is always taken from the store
//!  at the time of sending, so a message that waited in the queue carries up to date acks.

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::ack::{ack_message, build_ack};
use crate::context::RmContext;
use crate::store::records::{SendTask, SendingSequence, TaskKind};
use crate::wsrm::elements::AckRequested;
use crate::wsrm::message::{RmBody, RmMessage};


/// Builds the message for a send task. Returns `None` if the task can not be sent (any more),
///  e.g. because its sequence is gone.
///
/// NB: The caller must hold the lock of the task's sequence
pub async fn build_outbound(ctx: &RmContext, task: &SendTask) -> anyhow::Result<Option<RmMessage>> {
    let message = match task.kind {
        TaskKind::Application => {
            let Some(sequence) = ctx.registry.sending(&task.sequence_ref)? else {
                return Ok(None);
            };
            let Some(wire_id) = sequence.wire_id.clone() else {
                return Ok(None);
            };
            let Some(mut message) = stored_message(ctx, task)? else {
                return Ok(None);
            };

            if let Some(header) = &mut message.headers.sequence {
                header.identifier = wire_id.clone();
            }
            if task.sent_count > 0 || (task.message_number.is_some() && task.message_number == sequence.last_message_number) {
                message.headers.ack_requests = vec![AckRequested { identifier: wire_id, message_number: None }];
            }
            piggyback_ack(ctx, &sequence, &mut message).await?;
            message
        }
        TaskKind::Ack => {
            let Some(sequence) = ctx.registry.receiving(&task.sequence_ref)? else {
                return Ok(None);
            };
            ack_message(&sequence)
                .with_to(task.destination.clone())
        }
        TaskKind::AckRequest => {
            let Some(sequence) = ctx.registry.sending(&task.sequence_ref)? else {
                return Ok(None);
            };
            let Some(wire_id) = sequence.wire_id.clone() else {
                return Ok(None);
            };
            let mut message = RmMessage::new(sequence.version, RmBody::Empty)
                .with_to(task.destination.clone());
            message.message_id = task.message_id.clone();
            message.security_token = sequence.security_token.clone();
            message.headers.ack_requests.push(AckRequested { identifier: wire_id, message_number: None });
            message
        }
        TaskKind::CreateSequence | TaskKind::TerminateSequence | TaskKind::CloseSequence | TaskKind::MakeConnection | TaskKind::MakeConnectionResponse => {
            let Some(message) = stored_message(ctx, task)? else {
                return Ok(None);
            };
            message
        }
    };
    Ok(Some(message))
}

fn stored_message(ctx: &RmContext, task: &SendTask) -> anyhow::Result<Option<RmMessage>> {
    let Some(key) = &task.message_key else {
        return Ok(None);
    };
    let message = ctx.storage.retrieve_message(key)?;
    if message.is_none() {
        debug!("stored message for task {} is gone", task.message_id);
    }
    Ok(message)
}

/// Adds an acknowledgement for the reverse direction of an offer / accept pair to an
///  application message, provided it goes where the acks should go anyway. A pending ack task
///  for that sequence is covered by this and dropped.
///
/// NB: The caller must hold the lock of the sending sequence. This takes the receiving
///      sequence's lock, so locks are always acquired in that order.
async fn piggyback_ack(ctx: &RmContext, sequence: &SendingSequence, message: &mut RmMessage) -> anyhow::Result<()> {
    let reverse_id = match &sequence.offered_sequence_id {
        Some(offered_id) => Some(offered_id.clone()),
        None => ctx.storage.receiving.find(&|r| r.outbound_internal_id.as_deref() == Some(sequence.internal_id.as_str()))?
            .into_iter()
            .next()
            .map(|r| r.wire_id),
    };
    let Some(reverse_id) = reverse_id else {
        return Ok(());
    };

    // pending ack tasks may only be dropped if the snapshot covers everything they would ack
    let _guard = ctx.registry.lock_receiving(&reverse_id).await;
    let Some(reverse) = ctx.registry.receiving(&reverse_id)? else {
        return Ok(());
    };
    if reverse.is_terminated() || reverse.received.is_empty() || reverse.acks_to != sequence.destination {
        return Ok(());
    }

    trace!("piggy-backing ack for {} on message {}", reverse.wire_id, message.message_id);
    message.headers.acks.push(build_ack(&reverse));
    for task in ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack && t.sequence_ref == reverse.wire_id && t.sent_count == 0)? {
        ctx.storage.delete_send_task(&task.message_id)?;
    }
    Ok(())
}

/// Book keeping after a task was sent (or handed out on a poll): tasks that are sent only once
///  are deleted, all others are rescheduled with backoff. Sending a WS-RM 1.0 TerminateSequence
///  completes the termination.
///
/// A task that was deleted in the meantime, e.g. because it was acknowledged, is left alone.
///
/// NB: The caller must hold the lock of the task's sequence
pub fn mark_sent(ctx: &RmContext, task: &SendTask, now: Instant) -> anyhow::Result<()> {
    if !task.resend {
        ctx.storage.delete_send_task(&task.message_id)?;
        if task.kind == TaskKind::TerminateSequence {
            ctx.registry.cleanup_sending(&task.sequence_ref, now)?;
        }
        return Ok(());
    }

    let config = ctx.config.clone();
    let updated = ctx.storage.send_tasks.modify(&task.message_id, &mut |t| {
        t.sent_count += 1;
        t.first_sent_at.get_or_insert(now);
        t.next_send_time = now + config.retransmission_delay(t.sent_count);
    })?;
    match updated {
        Some(t) => trace!("task {} was sent {} times, next send at {:?}", t.message_id, t.sent_count, t.next_send_time),
        None => trace!("task {} was deleted while it was being sent", task.message_id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::registry::tests::{receiving_sequence, sending_sequence};
    use crate::store::records::SequenceState;
    use crate::test_util::test_context;
    use crate::test_util::transport::TrackingTransport;
    use crate::wsrm::elements::AckRange;
    use crate::wsrm::endpoint::EndpointAddr;

    async fn setup() -> (RmContext, SendTask) {
        let ctx = test_context(Arc::new(TrackingTransport::new()));
        ctx.registry.insert_sending(sending_sequence("s", Some("w"))).unwrap();
        ctx.registry.allocate_message("s", Bytes::from_static(b"payload"), false, Instant::now()).await.unwrap();
        let task = ctx.registry.sending_tasks("s", None).unwrap().remove(0);
        (ctx, task)
    }

    #[tokio::test]
    async fn test_build_application_message() {
        let (ctx, task) = setup().await;

        let message = build_outbound(&ctx, &task).await.unwrap().unwrap();
        assert_eq!(message.message_id, task.message_id);
        assert_eq!(message.headers.sequence.as_ref().unwrap().identifier, "w");
        assert!(message.headers.ack_requests.is_empty());
        assert!(message.headers.acks.is_empty());
        assert_eq!(message.body, RmBody::Application(Bytes::from_static(b"payload")));
    }

    #[tokio::test]
    async fn test_resend_requests_ack() {
        let (ctx, mut task) = setup().await;
        task.sent_count = 1;

        let message = build_outbound(&ctx, &task).await.unwrap().unwrap();
        assert_eq!(message.headers.ack_requests, vec![AckRequested { identifier: "w".to_string(), message_number: None }]);
    }

    #[tokio::test]
    async fn test_piggyback_ack_for_offered_sequence() {
        let (ctx, task) = setup().await;
        ctx.storage.sending.modify(&"s".to_string(), &mut |s| s.offered_sequence_id = Some("o".to_string())).unwrap();
        let mut offered = receiving_sequence("o");
        offered.acks_to = EndpointAddr::new("http://peer");
        offered.received.insert(1);
        ctx.registry.insert_receiving(offered.clone()).unwrap();

        let mut ack_task = SendTask::new(TaskKind::Ack, "o", EndpointAddr::new("http://peer"), Instant::now());
        ack_task.resend = false;
        ctx.storage.send_tasks.insert(ack_task).unwrap();

        let message = build_outbound(&ctx, &task).await.unwrap().unwrap();
        assert_eq!(message.headers.acks, vec![build_ack(&offered)]);
        assert!(ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_piggyback_ack_waits_for_receiving_sequence() {
        let (ctx, task) = setup().await;
        let ctx = Arc::new(ctx);
        ctx.storage.sending.modify(&"s".to_string(), &mut |s| s.offered_sequence_id = Some("o".to_string())).unwrap();
        let mut offered = receiving_sequence("o");
        offered.acks_to = EndpointAddr::new("http://peer");
        offered.received.insert(1);
        ctx.registry.insert_receiving(offered).unwrap();

        let guard = ctx.registry.lock_receiving("o").await;
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move { build_outbound(&ctx, &task).await.unwrap().unwrap() })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        // message #2 arrives and its ack is scheduled while the message is being built
        ctx.storage.receiving.modify(&"o".to_string(), &mut |r| {
            r.received.insert(2);
        }).unwrap();
        let mut ack_task = SendTask::new(TaskKind::Ack, "o", EndpointAddr::new("http://peer"), Instant::now());
        ack_task.resend = false;
        ctx.storage.send_tasks.insert(ack_task).unwrap();
        drop(guard);

        let message = handle.await.unwrap();
        assert_eq!(message.headers.acks[0].ranges, vec![AckRange::new(1, 2)]);
        assert!(ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_established() {
        let (ctx, task) = setup().await;
        ctx.storage.sending.modify(&"s".to_string(), &mut |s| {
            s.wire_id = None;
            s.state = SequenceState::Creating;
        }).unwrap();
        assert!(build_outbound(&ctx, &task).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_sent_backs_off() {
        let (ctx, task) = setup().await;

        let now = Instant::now();
        mark_sent(&ctx, &task, now).unwrap();
        let t = ctx.storage.send_tasks.get(&task.message_id).unwrap().unwrap();
        assert_eq!(t.sent_count, 1);
        assert_eq!(t.first_sent_at, Some(now));
        assert_eq!(t.next_send_time, now + ctx.config.retransmission_interval);

        mark_sent(&ctx, &t, now).unwrap();
        let t = ctx.storage.send_tasks.get(&task.message_id).unwrap().unwrap();
        assert_eq!(t.sent_count, 2);
        assert_eq!(t.next_send_time, now + 2 * ctx.config.retransmission_interval);
    }

    #[tokio::test]
    async fn test_mark_sent_after_delete() {
        let (ctx, task) = setup().await;
        ctx.storage.delete_send_task(&task.message_id).unwrap();

        mark_sent(&ctx, &task, Instant::now()).unwrap();
        assert!(ctx.storage.send_tasks.get(&task.message_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_sent_once() {
        let ctx = test_context(Arc::new(TrackingTransport::new()));
        ctx.registry.insert_receiving(receiving_sequence("r")).unwrap();
        let mut task = SendTask::new(TaskKind::Ack, "r", EndpointAddr::new("http://peer"), Instant::now());
        task.resend = false;
        ctx.storage.send_tasks.insert(task.clone()).unwrap();

        mark_sent(&ctx, &task, Instant::now()).unwrap();
        assert!(ctx.storage.send_tasks.get(&task.message_id).unwrap().is_none());
    }
}
