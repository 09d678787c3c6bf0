use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::collaborators::SignedElement;
use crate::context::RmContext;
use crate::dispatch::{send_fault, BackChannel, InvocationResponse};
use crate::fault::{RmError, RmFault};
use crate::polling::schedule_poll;
use crate::store::records::{ReceivingSequence, SendTask, SequenceState, TaskKind};
use crate::wsrm::elements::{AckRange, AckRequested, SequenceAcknowledgement};
use crate::wsrm::message::{RmBody, RmMessage};
use crate::wsrm::spec_version::SpecVersion;


/// The result of processing an acknowledgement for a sending sequence
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AckOutcome {
    /// the acknowledgement was rejected and a fault was sent back
    Faulted,
    Processed {
        internal_id: String,
        /// number of messages that were not acknowledged before
        newly_acked: u64,
        /// true if the last message number is known and everything up to it is acknowledged
        complete: bool,
    },
}

/// Both directions of acknowledgement handling: applying inbound acks to sending sequences,
///  and generating acks for receiving sequences.
pub struct AcknowledgementEngine {
    ctx: Arc<RmContext>,
}

impl AcknowledgementEngine {
    pub fn new(ctx: Arc<RmContext>) -> AcknowledgementEngine {
        AcknowledgementEngine { ctx }
    }

    /// Applies a `SequenceAcknowledgement`, either standalone or piggy-backed on some other
    ///  message, to the sending sequence it refers to. Acknowledged messages' send tasks are
    ///  deleted, and they are never re-sent afterwards.
    ///
    /// An invalid acknowledgement is answered with a fault and leaves all state untouched.
    pub async fn process_inbound_ack(&self, message: &RmMessage, ack: &SequenceAcknowledgement, back_channel: &mut BackChannel) -> Result<AckOutcome, RmError> {
        let Some(sequence) = self.ctx.registry.sending_by_wire_id(&ack.identifier)? else {
            debug!("acknowledgement for unknown sequence {}", ack.identifier);
            send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&ack.identifier)).await;
            return Ok(AckOutcome::Faulted);
        };
        if sequence.is_terminated() {
            debug!("acknowledgement for terminated sequence {}", ack.identifier);
            send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&ack.identifier)).await;
            return Ok(AckOutcome::Faulted);
        }

        self.ctx.verify_token(&sequence.security_token, SignedElement::SequenceAcknowledgement, message)?;

        if let Err(e) = ack.validate() {
            warn!("malformed acknowledgement: {}", e);
            let range = ack.ranges.first().copied().unwrap_or(AckRange::new(0, 0));
            send_fault(&self.ctx, back_channel, message, RmFault::invalid_acknowledgement(&ack.identifier, range)).await;
            return Ok(AckOutcome::Faulted);
        }

        let internal_id = sequence.internal_id.clone();
        let _guard = self.ctx.registry.lock_sending(&internal_id).await;
        let Some(mut sequence) = self.ctx.registry.sending(&internal_id)? else {
            send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&ack.identifier)).await;
            return Ok(AckOutcome::Faulted);
        };

        for range in &ack.ranges {
            if range.lower == 0 || range.lower > range.upper || range.upper > sequence.highest_message_number {
                debug!("acknowledgement range {:?} for {} is invalid, highest message number is {}", range, ack.identifier, sequence.highest_message_number);
                send_fault(&self.ctx, back_channel, message, RmFault::invalid_acknowledgement(&ack.identifier, *range)).await;
                return Ok(AckOutcome::Faulted);
            }
        }

        // work on a copy so that an invalid range further down leaves the sequence untouched
        let mut acked = sequence.acked.clone();
        let app_tasks: FxHashMap<u64, SendTask> = self.ctx.registry.sending_tasks(&internal_id, Some(TaskKind::Application))?
            .into_iter()
            .filter_map(|t| t.message_number.map(|n| (n, t)))
            .collect();

        let mut newly_acked = 0;
        let mut newly_acked_tasks = Vec::new();
        for range in &ack.ranges {
            for newly_covered in acked.insert_range(range.lower, range.upper) {
                newly_acked += newly_covered.upper - newly_covered.lower + 1;
                for n in newly_covered.lower..=newly_covered.upper {
                    if let Some(task) = app_tasks.get(&n) {
                        if task.sent_count == 0 {
                            debug!("message #{} of {} was acknowledged but never sent", n, ack.identifier);
                            send_fault(&self.ctx, back_channel, message, RmFault::invalid_acknowledgement(&ack.identifier, *range)).await;
                            return Ok(AckOutcome::Faulted);
                        }
                        newly_acked_tasks.push(task.message_id.clone());
                    }
                }
            }
        }

        if !ack.nacks.is_empty() {
            debug!("ignoring nacks {:?} for {} - unacknowledged messages are re-sent on schedule anyway", ack.nacks, ack.identifier);
        }

        for message_id in &newly_acked_tasks {
            self.ctx.storage.delete_send_task(message_id)?;
        }
        sequence.acked = acked;
        sequence.last_activity = Instant::now();
        let complete = sequence.is_complete();
        let offered_sequence_id = sequence.offered_sequence_id.clone();
        let destination = sequence.destination.clone();
        self.ctx.registry.update_sending(sequence)?;

        trace!("acknowledgement for {}: {} newly acked, complete: {}", internal_id, newly_acked, complete);

        // the peer may have messages for the offered sequence waiting for us to poll
        if let Some(offered_id) = offered_sequence_id {
            if let Some(offered) = self.ctx.registry.receiving(&offered_id)? {
                if offered.polling_mode && !offered.is_terminated() {
                    schedule_poll(&self.ctx, &offered_id, &destination, Instant::now())?;
                }
            }
        }

        Ok(AckOutcome::Processed { internal_id, newly_acked, complete })
    }

    /// Responds to an `AckRequested` with an immediate acknowledgement
    pub async fn process_ack_requested(&self, message: &RmMessage, ack_requested: &AckRequested, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let sequence = match self.ctx.registry.receiving(&ack_requested.identifier)? {
            Some(s) if !s.is_terminated() => s,
            _ => {
                debug!("ack requested for unknown sequence {}", ack_requested.identifier);
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&ack_requested.identifier)).await);
            }
        };

        self.ctx.verify_token(&sequence.security_token, SignedElement::AckRequested, message)?;

        let _guard = self.ctx.registry.lock_receiving(&sequence.wire_id).await;
        self.generate_ack(&sequence.wire_id, true, Some(back_channel), Instant::now())?;
        Ok(InvocationResponse::Continue)
    }

    /// Asks the peer to acknowledge a sending sequence's messages with a standalone
    ///  `AckRequested`
    pub async fn request_ack(&self, internal_id: &str) -> Result<(), RmError> {
        let _guard = self.ctx.registry.lock_sending(internal_id).await;
        let Some(sequence) = self.ctx.registry.sending(internal_id)? else {
            return Err(RmError::UnknownSequence(internal_id.to_string()));
        };
        if sequence.is_terminated() {
            return Err(RmError::SequenceTerminated(internal_id.to_string()));
        }
        if sequence.wire_id.is_none() {
            return Err(RmError::NotEstablished(internal_id.to_string()));
        }

        let mut task = SendTask::new(TaskKind::AckRequest, internal_id, sequence.destination.clone(), Instant::now());
        task.resend = false;
        self.ctx.storage.send_tasks.insert(task)?;
        Ok(())
    }

    /// Makes sure an acknowledgement for a receiving sequence goes out. If the sequence's acks-to
    ///  is anonymous and the back channel is free, the ack goes there right away. Otherwise an
    ///  ack task is scheduled, replacing one that is pending already - so acks for messages
    ///  arriving in quick succession are coalesced.
    ///
    /// An anonymous acks-to can not be sent to directly: its ack task waits for the next free
    ///  back channel of a message on the sequence, or for a poll.
    ///
    /// NB: The caller must hold the sequence's lock
    pub fn generate_ack(&self, wire_id: &str, immediate: bool, back_channel: Option<&mut BackChannel>, now: Instant) -> anyhow::Result<()> {
        let Some(sequence) = self.ctx.registry.receiving(wire_id)? else {
            return Err(anyhow::anyhow!("generating ack for unknown sequence {}", wire_id));
        };

        if sequence.acks_to.is_anonymous() && !sequence.acks_to.is_rm_anonymous() {
            if let Some(back_channel) = back_channel {
                let ack_message = ack_message(&sequence);
                trace!("sending ack for {} on the back channel: {:?}", wire_id, ack_message.headers.acks);
                match back_channel.respond(ack_message) {
                    Ok(()) => {
                        // the ack on the back channel covers everything a pending task would ack
                        for task in self.pending_acks(wire_id)? {
                            self.ctx.storage.delete_send_task(&task.message_id)?;
                        }
                        return Ok(());
                    }
                    Err(_) => debug!("back channel for the ack of {} is not available", wire_id),
                }
            }
            debug!("parking ack for {} until a back channel is available", wire_id);
            return self.schedule_ack(&sequence, now, now);
        }

        let delay = if immediate { Duration::ZERO } else { self.ctx.config.acknowledgement_interval };
        self.schedule_ack(&sequence, now + delay, now)
    }

    fn pending_acks(&self, wire_id: &str) -> anyhow::Result<Vec<SendTask>> {
        self.ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::Ack && t.sequence_ref == wire_id && t.sent_count == 0)
    }

    fn schedule_ack(&self, sequence: &ReceivingSequence, send_time: Instant, now: Instant) -> anyhow::Result<()> {
        let pending = self.pending_acks(&sequence.wire_id)?;

        // a pending ack keeps its (earlier) send time
        let mut next_send_time = send_time;
        for task in pending {
            next_send_time = next_send_time.min(task.next_send_time);
            self.ctx.storage.delete_send_task(&task.message_id)?;
        }

        let mut task = SendTask::new(TaskKind::Ack, &sequence.wire_id, sequence.acks_to.clone(), now);
        task.next_send_time = next_send_time;
        task.resend = false;
        if sequence.polling_mode || sequence.acks_to.is_anonymous() {
            task.transport_available = false;
        }
        trace!("scheduling ack for {} at {:?}", sequence.wire_id, next_send_time);
        self.ctx.storage.send_tasks.insert(task)
    }
}

/// The acknowledgement element reflecting a receiving sequence's current state
pub fn build_ack(sequence: &ReceivingSequence) -> SequenceAcknowledgement {
    let is_final = sequence.closed || matches!(sequence.state, SequenceState::Closing | SequenceState::Terminated);
    SequenceAcknowledgement {
        identifier: sequence.wire_id.clone(),
        ranges: sequence.received.to_ack_ranges(),
        nacks: Vec::new(),
        none: sequence.version == SpecVersion::V1_1 && sequence.received.is_empty(),
        final_ack: sequence.version == SpecVersion::V1_1 && is_final,
    }
}

/// a standalone acknowledgement message for a receiving sequence
pub fn ack_message(sequence: &ReceivingSequence) -> RmMessage {
    let mut message = RmMessage::new(sequence.version, RmBody::Empty)
        .with_to(sequence.acks_to.clone());
    message.headers.acks.push(build_ack(sequence));
    message
}
