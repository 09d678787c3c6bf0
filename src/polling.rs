use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::collaborators::SignedElement;
use crate::context::RmContext;
use crate::dispatch::{send_fault, BackChannel, InvocationResponse};
use crate::fault::{RmError, RmFault};
use crate::outbound::{build_outbound, mark_sent};
use crate::store::records::{ReceivingSequence, SendTask, TaskKind};
use crate::util::random::{Random, RngRandom};
use crate::wsrm::elements::{MakeConnection, MessagePending};
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{RmBody, RmMessage};
use crate::wsrm::spec_version::SpecVersion;


/// Serves MakeConnection polls: messages for endpoints that can not be reached (RM anonymous
///  addresses) wait as send tasks until their endpoint polls, and then go out on the poll's
///  back channel.
pub struct PollingManager<R: Random = RngRandom> {
    ctx: Arc<RmContext>,
    _random: PhantomData<R>,
}

impl <R: Random> PollingManager<R> {
    pub fn new(ctx: Arc<RmContext>) -> PollingManager<R> {
        PollingManager {
            ctx,
            _random: Default::default(),
        }
    }

    /// Picks one of the messages waiting for the polling endpoint and returns it on the back
    ///  channel, flagging it with `MessagePending` if there are more. The pick is random among
    ///  the candidates so that a single sequence can not starve the others.
    pub async fn process_make_connection(&self, message: &RmMessage, make_connection: &MakeConnection, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        if make_connection.address.is_none() && make_connection.identifier.is_none() {
            warn!("MakeConnection {} has neither address nor identifier - ignoring it", message.message_id);
            return Ok(InvocationResponse::Abort);
        }

        let sequence_refs = match &make_connection.identifier {
            None => None,
            Some(identifier) => match self.sequence_refs(message, identifier)? {
                Some(refs) => Some(refs),
                None => return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(identifier)).await),
            }
        };

        let now = Instant::now();
        let is_candidate = |t: &SendTask| {
            t.send
                && !t.transport_available
                && (t.resend || t.sent_count == 0)
                && t.next_send_time <= now
                && make_connection.address.as_ref().map(|a| a == &t.destination).unwrap_or(true)
                && sequence_refs.as_ref().map(|refs| refs.contains(&t.sequence_ref)).unwrap_or(true)
        };
        let mut candidates = self.ctx.storage.send_tasks.find(&is_candidate)?;

        while !candidates.is_empty() {
            let picked = candidates.swap_remove(R::gen_usize_range(0..candidates.len()));

            let _guard = self.ctx.registry.lock_for_task(&picked).await;
            // a concurrent poll may have handed the task out while we were waiting for the lock
            let task = match self.ctx.storage.send_tasks.get(&picked.message_id)? {
                Some(task) if is_candidate(&task) => task,
                _ => {
                    debug!("task {} is no longer pending, trying another one for poll {}", picked.message_id, message.message_id);
                    continue;
                }
            };
            let Some(mut response) = build_outbound(&self.ctx, &task).await? else {
                self.ctx.storage.delete_send_task(&task.message_id)?;
                continue;
            };
            if !candidates.is_empty() {
                response.headers.message_pending = Some(MessagePending { pending: true });
            }

            debug!("handing out {:?} task {} on poll {}", task.kind, task.message_id, message.message_id);
            if let Err(response) = back_channel.respond(response) {
                warn!("back channel of poll {} is taken, can not hand out {}", message.message_id, response.message_id);
                return Ok(InvocationResponse::Abort);
            }
            mark_sent(&self.ctx, &task, now)?;
            return Ok(InvocationResponse::Abort);
        }

        trace!("nothing pending for poll {}", message.message_id);
        Ok(InvocationResponse::Abort)
    }

    /// The `sequence_ref`s of tasks belonging to a sequence on either side, `None` if the id is
    ///  not known
    fn sequence_refs(&self, message: &RmMessage, identifier: &str) -> Result<Option<FxHashSet<String>>, RmError> {
        let mut refs = FxHashSet::default();
        if let Some(sending) = self.ctx.registry.sending_by_wire_id(identifier)? {
            self.ctx.verify_token(&sending.security_token, SignedElement::Body, message)?;
            refs.insert(sending.internal_id);
        }
        if let Some(receiving) = self.ctx.registry.receiving(identifier)? {
            self.ctx.verify_token(&receiving.security_token, SignedElement::Body, message)?;
            refs.insert(receiving.wire_id);
        }
        Ok(if refs.is_empty() { None } else { Some(refs) })
    }

    /// Reacts to a `MessagePending` header on an inbound message by polling again right away
    pub fn process_message_pending(&self, message: &RmMessage) -> anyhow::Result<()> {
        let Some(pending) = &message.headers.message_pending else {
            return Ok(());
        };
        if !pending.pending {
            return Ok(());
        }

        let receiving = match &message.headers.sequence {
            Some(header) => self.ctx.registry.receiving(&header.identifier)?,
            None => None,
        };
        let polling = receiving.into_iter()
            .chain(self.ctx.storage.receiving.find(&|r| r.polling_mode && !r.is_terminated())?)
            .find(|r| r.polling_mode && !r.is_terminated());

        match polling {
            Some(sequence) => match poll_target(&self.ctx, &sequence)? {
                Some(target) => schedule_poll(&self.ctx, &sequence.wire_id, &target, Instant::now()),
                None => Ok(()),
            },
            None => {
                debug!("message {} says more messages are pending, but there is no polling sequence", message.message_id);
                Ok(())
            }
        }
    }
}

/// where to poll for messages of a receiving sequence in polling mode: the endpoint that this
///  side sends the sequence's reverse direction to. Sequences of a profile without
///  MakeConnection are never polled.
pub fn poll_target(ctx: &RmContext, sequence: &ReceivingSequence) -> anyhow::Result<Option<EndpointAddr>> {
    if !sequence.version.supports_make_connection() {
        return Ok(None);
    }
    let Some(outbound_id) = &sequence.outbound_internal_id else {
        return Ok(None);
    };
    Ok(ctx.registry.sending(outbound_id)?
        .map(|s| s.destination))
}

/// Schedules a MakeConnection poll for a receiving sequence at `send_time`, unless one is
///  pending already
pub fn schedule_poll(ctx: &RmContext, wire_id: &str, to: &EndpointAddr, send_time: Instant) -> anyhow::Result<()> {
    let pending = ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::MakeConnection && t.sequence_ref == wire_id && t.sent_count == 0)?;
    if !pending.is_empty() {
        return Ok(());
    }

    let message = RmMessage::new(SpecVersion::V1_1, RmBody::MakeConnection(MakeConnection {
        address: None,
        identifier: Some(wire_id.to_string()),
    }))
        .with_to(to.clone());

    let mut task = SendTask::new(TaskKind::MakeConnection, wire_id, to.clone(), send_time);
    task.message_id = message.message_id.clone();
    task.resend = false;
    task.message_key = Some(ctx.storage.store_message(message)?);
    trace!("scheduling poll for {} at {}", wire_id, to);
    ctx.storage.send_tasks.insert(task)
}
