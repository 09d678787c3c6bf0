use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ack::build_ack;
use crate::collaborators::{DeliveryFailure, SignedElement};
use crate::context::RmContext;
use crate::dispatch::{deliver_reply, send_fault, BackChannel, InvocationResponse};
use crate::fault::{RmError, RmFault};
use crate::polling::schedule_poll;
use crate::ranges::AckRangeSet;
use crate::store::records::{ReceivingSequence, SendTask, SendingSequence, SequenceState, TaskKind};
use crate::wsrm::elements::{Accept, CloseSequence, CloseSequenceResponse, CreateSequence, CreateSequenceResponse, SequenceOffer, TerminateSequence, TerminateSequenceResponse};
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{new_message_id, RmBody, RmMessage, SecurityTokenRef};
use crate::wsrm::spec_version::SpecVersion;


/// Parameters for creating a sending sequence
#[derive(Clone, Debug)]
pub struct CreateSequenceRequest {
    pub destination: EndpointAddr,
    /// where the peer sends acknowledgements, i.e. this side's address
    pub acks_to: EndpointAddr,
    pub reply_to: Option<EndpointAddr>,
    /// identifier to offer the peer for the reverse direction
    pub offer: Option<String>,
    pub version: SpecVersion,
    pub security_token: Option<SecurityTokenRef>,
}

/// the internal id of the sending sequence that is created when this side accepts an offer
pub fn offered_internal_id(inbound_wire_id: &str) -> String {
    format!("offered:{}", inbound_wire_id)
}

/// Creating, closing and terminating sequences, for both sides.
pub struct SequenceLifecycle {
    ctx: Arc<RmContext>,
}

impl SequenceLifecycle {
    pub fn new(ctx: Arc<RmContext>) -> SequenceLifecycle {
        SequenceLifecycle { ctx }
    }

    /// Registers a new sending sequence and schedules its CreateSequence message. There is
    ///  exactly one CreateSequence per sequence: it is re-sent with the same message id until a
    ///  response arrives.
    pub async fn create_sequence(&self, internal_id: &str, request: CreateSequenceRequest) -> Result<SendingSequence, RmError> {
        let _guard = self.ctx.registry.lock_sending(internal_id).await;
        if self.ctx.registry.sending(internal_id)?.is_some() {
            return Err(RmError::SequenceExists(internal_id.to_string()));
        }

        let now = Instant::now();
        let offer = request.offer.as_ref().map(|offered_id| SequenceOffer {
            identifier: offered_id.clone(),
            endpoint: request.version.requires_offer_endpoint()
                .then(|| request.reply_to.clone().unwrap_or_else(|| request.acks_to.clone())),
            expires: None,
        });

        let mut message = RmMessage::new(request.version, RmBody::CreateSequence(CreateSequence {
            acks_to: request.acks_to.clone(),
            offer,
            expires: None,
        }))
            .with_to(request.destination.clone())
            .with_reply_to(Some(request.reply_to.clone().unwrap_or_else(|| request.acks_to.clone())));
        message.security_token = request.security_token.clone();

        let sequence = SendingSequence {
            internal_id: internal_id.to_string(),
            wire_id: None,
            version: request.version,
            state: SequenceState::Creating,
            destination: request.destination.clone(),
            acks_to: request.acks_to.clone(),
            reply_to: request.reply_to.clone(),
            highest_message_number: 0,
            last_message_number: None,
            closed: false,
            acked: AckRangeSet::new(),
            offered_sequence_id: request.offer.clone(),
            security_token: request.security_token.clone(),
            polling_mode: request.acks_to.is_rm_anonymous(),
            create_sequence_message_id: Some(message.message_id.clone()),
            terminate_added: false,
            last_activity: now,
            terminated_at: None,
        };
        self.ctx.registry.insert_sending(sequence.clone())?;

        let mut task = SendTask::new(TaskKind::CreateSequence, internal_id, request.destination.clone(), now);
        task.message_id = message.message_id.clone();
        task.message_key = Some(self.ctx.storage.store_message(message)?);
        self.ctx.storage.send_tasks.insert(task)?;

        info!("creating sequence {} to {} ({:?})", internal_id, request.destination, request.version);
        Ok(sequence)
    }

    /// Completes sequence creation: the sending sequence gets its wire id, and messages that
    ///  were queued while waiting become eligible for sending. If the response accepts an offer,
    ///  the reverse sequence is registered.
    pub async fn on_create_sequence_response(&self, message: &RmMessage, response: &CreateSequenceResponse, _back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let Some(relates_to) = &message.relates_to else {
            warn!("CreateSequenceResponse {} does not relate to a request - ignoring it", message.message_id);
            return Ok(InvocationResponse::Abort);
        };
        let Some(sequence) = self.ctx.registry.sending_by_create_message_id(relates_to)? else {
            warn!("CreateSequenceResponse {} relates to unknown request {} - ignoring it", message.message_id, relates_to);
            return Ok(InvocationResponse::Abort);
        };

        let _guard = self.ctx.registry.lock_sending(&sequence.internal_id).await;
        let Some(mut sequence) = self.ctx.registry.sending(&sequence.internal_id)? else {
            return Ok(InvocationResponse::Abort);
        };
        if sequence.wire_id.is_some() || sequence.is_terminated() {
            debug!("duplicate CreateSequenceResponse for {} - ignoring it", sequence.internal_id);
            return Ok(InvocationResponse::Abort);
        }

        self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

        let now = Instant::now();
        if let Some(offered_id) = sequence.offered_sequence_id.clone() {
            match &response.accept {
                Some(accept) => {
                    let polling_mode = sequence.reply_to.as_ref().unwrap_or(&sequence.acks_to).is_rm_anonymous();
                    self.ctx.registry.insert_receiving(ReceivingSequence {
                        wire_id: offered_id.clone(),
                        version: sequence.version,
                        state: SequenceState::Established,
                        acks_to: accept.acks_to.clone(),
                        to: sequence.reply_to.clone().or(Some(sequence.acks_to.clone())),
                        highest_message_number: 0,
                        highest_message_id: None,
                        last_message_id: None,
                        last_message_number: None,
                        received: AckRangeSet::new(),
                        next_to_invoke: 1,
                        closed: false,
                        security_token: sequence.security_token.clone(),
                        polling_mode,
                        outbound_internal_id: Some(sequence.internal_id.clone()),
                        last_activity: now,
                        terminated_at: None,
                    })?;
                    if polling_mode {
                        schedule_poll(&self.ctx, &offered_id, &sequence.destination, now)?;
                    }
                }
                None => {
                    debug!("peer did not accept offered sequence {}", offered_id);
                    sequence.offered_sequence_id = None;
                }
            }
        }

        info!("sequence {} established with id {}", sequence.internal_id, response.identifier);
        sequence.wire_id = Some(response.identifier.clone());
        if sequence.state == SequenceState::Creating {
            sequence.state = SequenceState::Established;
        }
        sequence.last_activity = now;
        let internal_id = sequence.internal_id.clone();
        self.ctx.registry.update_sending(sequence)?;

        for task in self.ctx.registry.sending_tasks(&internal_id, None)? {
            match task.kind {
                TaskKind::CreateSequence => {
                    self.ctx.storage.delete_send_task(&task.message_id)?;
                }
                _ => {
                    self.ctx.storage.send_tasks.modify(&task.message_id, &mut |t| {
                        t.send = true;
                        t.next_send_time = t.next_send_time.min(now);
                    })?;
                }
            }
        }
        Ok(InvocationResponse::Abort)
    }

    /// Is an offered sequence id acceptable? It must be non-trivial and not in use by any other
    ///  sequence.
    pub fn offer_accepted(&self, offered_id: &str) -> anyhow::Result<bool> {
        if offered_id.trim().is_empty() {
            return Ok(false);
        }
        if offered_id.chars().count() <= 1 {
            return Ok(false);
        }
        Ok(!self.ctx.registry.is_wire_id_in_use(offered_id)?)
    }

    /// Accepts a peer's CreateSequence: registers the receiving sequence (and the reverse
    ///  sequence if an offer is acceptable) and sends the CreateSequenceResponse. Anything that
    ///  goes wrong is reported to the peer as CreateSequenceRefused.
    pub async fn accept_inbound_create(&self, message: &RmMessage, create: &CreateSequence, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        if create.acks_to.is_empty() {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::create_sequence_refused("AcksTo must not be empty")).await);
        }

        // the sequence is bound to the token the CreateSequence was secured with
        let security_token = message.security_token.clone();
        self.ctx.verify_token(&security_token, SignedElement::Body, message)?;

        let wire_id = new_message_id();
        let response = match self.register_inbound(message, create, &wire_id, security_token) {
            Ok(response) => response,
            Err(e) => {
                warn!("refusing CreateSequence {}: {}", message.message_id, e);
                if let Err(e) = self.ctx.registry.remove_receiving(&wire_id) {
                    warn!("failed to roll back receiving sequence {}: {}", wire_id, e);
                }
                if let Err(e) = self.ctx.registry.remove_sending(&offered_internal_id(&wire_id)) {
                    warn!("failed to roll back offered sequence for {}: {}", wire_id, e);
                }
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::create_sequence_refused(e.to_string())).await);
            }
        };

        info!("accepted sequence {} from {:?}", wire_id, message.reply_to);
        deliver_reply(&self.ctx, back_channel, message, response, &wire_id).await?;
        Ok(InvocationResponse::Abort)
    }

    fn register_inbound(&self, message: &RmMessage, create: &CreateSequence, wire_id: &str, security_token: Option<SecurityTokenRef>) -> anyhow::Result<RmMessage> {
        let now = Instant::now();
        let version = message.version;
        let our_address = message.to.clone()
            .unwrap_or_else(EndpointAddr::anonymous);

        let accepted_offer = match &create.offer {
            Some(offer) => self.check_offer(offer, version)?,
            None => None,
        };

        let outbound_internal_id = match &accepted_offer {
            Some((offered_id, destination)) => {
                let internal_id = offered_internal_id(wire_id);
                self.ctx.registry.insert_sending(SendingSequence {
                    internal_id: internal_id.clone(),
                    wire_id: Some(offered_id.clone()),
                    version,
                    state: SequenceState::Established,
                    destination: destination.clone(),
                    acks_to: our_address.clone(),
                    reply_to: None,
                    highest_message_number: 0,
                    last_message_number: None,
                    closed: false,
                    acked: AckRangeSet::new(),
                    offered_sequence_id: None,
                    security_token: security_token.clone(),
                    polling_mode: destination.is_rm_anonymous(),
                    create_sequence_message_id: None,
                    terminate_added: false,
                    last_activity: now,
                    terminated_at: None,
                })?;
                Some(internal_id)
            }
            None => None,
        };

        self.ctx.registry.insert_receiving(ReceivingSequence {
            wire_id: wire_id.to_string(),
            version,
            state: SequenceState::Established,
            acks_to: create.acks_to.clone(),
            to: message.to.clone(),
            highest_message_number: 0,
            highest_message_id: None,
            last_message_id: None,
            last_message_number: None,
            received: AckRangeSet::new(),
            next_to_invoke: 1,
            closed: false,
            security_token,
            polling_mode: create.acks_to.is_rm_anonymous(),
            outbound_internal_id,
            last_activity: now,
            terminated_at: None,
        })?;

        let response = RmMessage::new(version, RmBody::CreateSequenceResponse(CreateSequenceResponse {
            identifier: wire_id.to_string(),
            expires: None,
            accept: accepted_offer.map(|_| Accept { acks_to: our_address }),
        }))
            .with_relates_to(&message.message_id);
        Ok(response)
    }

    /// the offered id and the address to send the offered sequence's messages to, or `None` if
    ///  the offer is not acceptable
    fn check_offer(&self, offer: &SequenceOffer, version: SpecVersion) -> anyhow::Result<Option<(String, EndpointAddr)>> {
        if !self.offer_accepted(&offer.identifier)? {
            debug!("offered sequence id {:?} is not acceptable", offer.identifier);
            return Ok(None);
        }
        if version.requires_offer_endpoint() {
            match &offer.endpoint {
                Some(endpoint) if !endpoint.is_empty() && !(endpoint.is_anonymous() && !endpoint.is_rm_anonymous()) => {
                    Ok(Some((offer.identifier.clone(), endpoint.clone())))
                }
                _ => {
                    debug!("offer {:?} has no usable endpoint", offer.identifier);
                    Ok(None)
                }
            }
        }
        else {
            Ok(Some((offer.identifier.clone(), offer.endpoint.clone().unwrap_or_else(EndpointAddr::anonymous))))
        }
    }

    /// Schedules TerminateSequence for a sending sequence. This is refused unless every message
    ///  up to the last one is acknowledged. Requesting termination twice is harmless.
    pub async fn request_termination(&self, internal_id: &str) -> Result<(), RmError> {
        let _guard = self.ctx.registry.lock_sending(internal_id).await;
        let Some(mut sequence) = self.ctx.registry.sending(internal_id)? else {
            return Err(RmError::UnknownSequence(internal_id.to_string()));
        };
        if sequence.is_terminated() {
            return Err(RmError::SequenceTerminated(internal_id.to_string()));
        }
        if sequence.terminate_added {
            debug!("termination of {} was requested already", internal_id);
            return Ok(());
        }
        let Some(wire_id) = sequence.wire_id.clone() else {
            return Err(RmError::NotEstablished(internal_id.to_string()));
        };

        let last_message_number = sequence.last_message_number.unwrap_or(sequence.highest_message_number);
        if !sequence.acked.complete_up_to(last_message_number) {
            debug!("refusing to terminate {}: acknowledged {} of {}", internal_id, sequence.acked, last_message_number);
            return Err(RmError::TerminationRefused {
                sequence_id: internal_id.to_string(),
                last_message_number,
            });
        }

        let now = Instant::now();
        let mut message = RmMessage::new(sequence.version, RmBody::TerminateSequence(TerminateSequence {
            identifier: wire_id,
            last_message_number: sequence.version.requires_terminate_response().then_some(last_message_number),
        }))
            .with_to(sequence.destination.clone())
            .with_reply_to(Some(sequence.acks_to.clone()));
        message.security_token = sequence.security_token.clone();

        let mut task = SendTask::new(TaskKind::TerminateSequence, internal_id, sequence.destination.clone(), now);
        task.message_id = message.message_id.clone();
        task.next_send_time = now + self.ctx.config.terminate_delay;
        task.resend = sequence.version.requires_terminate_response();
        task.message_key = Some(self.ctx.storage.store_message(message)?);
        self.ctx.storage.send_tasks.insert(task)?;

        sequence.last_message_number = Some(last_message_number);
        sequence.terminate_added = true;
        sequence.state = SequenceState::Terminating;
        sequence.last_activity = now;
        self.ctx.registry.update_sending(sequence)?;

        info!("terminating sequence {}", internal_id);
        Ok(())
    }

    pub async fn on_terminate_sequence_response(&self, message: &RmMessage, response: &TerminateSequenceResponse, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let Some(sequence) = self.ctx.registry.sending_by_wire_id(&response.identifier)? else {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&response.identifier)).await);
        };
        self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

        let _guard = self.ctx.registry.lock_sending(&sequence.internal_id).await;
        if sequence.is_terminated() {
            debug!("duplicate TerminateSequenceResponse for {}", sequence.internal_id);
            return Ok(InvocationResponse::Abort);
        }
        self.ctx.registry.cleanup_sending(&sequence.internal_id, Instant::now())?;
        info!("sequence {} is terminated", sequence.internal_id);
        Ok(InvocationResponse::Abort)
    }

    /// The peer terminates a sequence. This is usually a receiving sequence, but WS-RM 1.1 allows
    ///  either side to terminate.
    pub async fn on_terminate_sequence(&self, message: &RmMessage, terminate: &TerminateSequence, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let now = Instant::now();

        if let Some(sequence) = self.ctx.registry.receiving(&terminate.identifier)? {
            if sequence.is_terminated() {
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&terminate.identifier)).await);
            }
            self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

            let _guard = self.ctx.registry.lock_receiving(&sequence.wire_id).await;
            let Some(mut sequence) = self.ctx.registry.receiving(&terminate.identifier)? else {
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&terminate.identifier)).await);
            };
            if let (Some(last), Some(announced)) = (sequence.last_message_number, terminate.last_message_number) {
                if announced != last {
                    warn!("TerminateSequence for {} says the last message is #{}, but it was #{}", sequence.wire_id, announced, last);
                }
            }
            sequence.last_message_number = sequence.last_message_number
                .or(terminate.last_message_number)
                .or(Some(sequence.highest_message_number));
            sequence.state = SequenceState::Terminated;
            sequence.terminated_at = Some(now);
            sequence.last_activity = now;
            self.ctx.registry.update_receiving(sequence.clone())?;
            self.ctx.registry.cleanup_receiving(&sequence.wire_id, now)?;
            info!("peer terminated sequence {}", sequence.wire_id);

            let body = if sequence.version.requires_terminate_response() {
                RmBody::TerminateSequenceResponse(TerminateSequenceResponse { identifier: sequence.wire_id.clone() })
            }
            else {
                RmBody::Empty
            };
            let mut reply = RmMessage::new(sequence.version, body)
                .with_relates_to(&message.message_id);
            reply.headers.acks.push(build_ack(&sequence));
            deliver_reply(&self.ctx, back_channel, message, reply, &sequence.wire_id).await?;
            return Ok(InvocationResponse::Abort);
        }

        if let Some(sequence) = self.ctx.registry.sending_by_wire_id(&terminate.identifier)? {
            if sequence.is_terminated() {
                return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&terminate.identifier)).await);
            }
            self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

            self.fail_sending_sequence(&sequence.internal_id, "the peer terminated the sequence").await?;
            if sequence.version.requires_terminate_response() {
                let reply = RmMessage::new(sequence.version, RmBody::TerminateSequenceResponse(TerminateSequenceResponse { identifier: terminate.identifier.clone() }))
                    .with_relates_to(&message.message_id);
                deliver_reply(&self.ctx, back_channel, message, reply, &terminate.identifier).await?;
            }
            return Ok(InvocationResponse::Abort);
        }

        Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&terminate.identifier)).await)
    }

    /// Closes a sending sequence: no new messages are accepted, while acknowledgement of those
    ///  sent so far continues. With WS-RM 1.1 the peer is told by a CloseSequence message.
    pub async fn close_sequence(&self, internal_id: &str) -> Result<(), RmError> {
        let _guard = self.ctx.registry.lock_sending(internal_id).await;
        let Some(mut sequence) = self.ctx.registry.sending(internal_id)? else {
            return Err(RmError::UnknownSequence(internal_id.to_string()));
        };
        if sequence.is_terminated() {
            return Err(RmError::SequenceTerminated(internal_id.to_string()));
        }
        if sequence.closed {
            return Ok(());
        }

        let now = Instant::now();
        sequence.closed = true;
        sequence.last_message_number.get_or_insert(sequence.highest_message_number);
        if sequence.state.accepts_messages() {
            sequence.state = SequenceState::Closing;
        }
        sequence.last_activity = now;

        if sequence.version.supports_close() {
            let mut message = RmMessage::new(sequence.version, RmBody::CloseSequence(CloseSequence {
                identifier: sequence.wire_id.clone().unwrap_or_default(),
                last_message_number: sequence.last_message_number,
            }))
                .with_to(sequence.destination.clone())
                .with_reply_to(Some(sequence.acks_to.clone()));
            message.security_token = sequence.security_token.clone();

            let mut task = SendTask::new(TaskKind::CloseSequence, internal_id, sequence.destination.clone(), now);
            task.message_id = message.message_id.clone();
            task.send = sequence.wire_id.is_some();
            task.message_key = Some(self.ctx.storage.store_message(message)?);
            self.ctx.storage.send_tasks.insert(task)?;
        }
        self.ctx.registry.update_sending(sequence)?;

        info!("closed sequence {}", internal_id);
        Ok(())
    }

    pub async fn on_close_sequence_response(&self, message: &RmMessage, response: &CloseSequenceResponse, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let Some(sequence) = self.ctx.registry.sending_by_wire_id(&response.identifier)? else {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&response.identifier)).await);
        };
        self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

        let _guard = self.ctx.registry.lock_sending(&sequence.internal_id).await;
        for task in self.ctx.registry.sending_tasks(&sequence.internal_id, Some(TaskKind::CloseSequence))? {
            self.ctx.storage.delete_send_task(&task.message_id)?;
        }
        debug!("peer confirmed closing {}", sequence.internal_id);
        Ok(InvocationResponse::Abort)
    }

    /// The peer closes a receiving sequence: further messages are refused, and the response
    ///  carries the final acknowledgement.
    pub async fn on_close_sequence(&self, message: &RmMessage, close: &CloseSequence, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        let sequence = match self.ctx.registry.receiving(&close.identifier)? {
            Some(s) if !s.is_terminated() => s,
            _ => return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&close.identifier)).await),
        };
        self.ctx.verify_token(&sequence.security_token, SignedElement::Body, message)?;

        let _guard = self.ctx.registry.lock_receiving(&sequence.wire_id).await;
        let Some(mut sequence) = self.ctx.registry.receiving(&close.identifier)? else {
            return Ok(send_fault(&self.ctx, back_channel, message, RmFault::unknown_sequence(&close.identifier)).await);
        };
        sequence.closed = true;
        if sequence.state.accepts_messages() {
            sequence.state = SequenceState::Closing;
        }
        sequence.last_message_number = sequence.last_message_number
            .or(close.last_message_number)
            .or(Some(sequence.highest_message_number));
        sequence.last_activity = Instant::now();
        self.ctx.registry.update_receiving(sequence.clone())?;
        info!("peer closed sequence {}", sequence.wire_id);

        let mut reply = RmMessage::new(sequence.version, RmBody::CloseSequenceResponse(CloseSequenceResponse { identifier: sequence.wire_id.clone() }))
            .with_relates_to(&message.message_id);
        reply.headers.acks.push(build_ack(&sequence));
        deliver_reply(&self.ctx, back_channel, message, reply, &sequence.wire_id).await?;
        Ok(InvocationResponse::Abort)
    }

    /// Gives up on a sending sequence, e.g. because creating it was refused. Every message that
    ///  was not acknowledged is reported to the application as failed.
    pub async fn fail_sending_sequence(&self, internal_id: &str, reason: &str) -> anyhow::Result<()> {
        let pending = {
            let _guard = self.ctx.registry.lock_sending(internal_id).await;
            match self.ctx.registry.sending(internal_id)? {
                Some(s) if !s.is_terminated() => {}
                _ => return Ok(()),
            }
            self.ctx.registry.cleanup_sending(internal_id, Instant::now())?
        };
        warn!("sequence {} failed: {}", internal_id, reason);

        self.ctx.listener.on_delivery_failure(DeliveryFailure {
            internal_sequence_id: internal_id.to_string(),
            message_number: None,
            reason: reason.to_string(),
        }).await;
        for task in pending {
            self.ctx.listener.on_delivery_failure(DeliveryFailure {
                internal_sequence_id: internal_id.to_string(),
                message_number: task.message_number,
                reason: reason.to_string(),
            }).await;
        }
        Ok(())
    }

    /// Applies a fault the peer sent in response to one of this side's messages. Faults that
    ///  make a sending sequence unusable fail it; all faults are passed on to the application.
    pub async fn on_fault(&self, message: &RmMessage, fault: &RmFault) -> anyhow::Result<()> {
        use crate::fault::FaultKind;

        let affected = match fault.kind {
            FaultKind::CreateSequenceRefused => match &message.relates_to {
                Some(relates_to) => self.ctx.registry.sending_by_create_message_id(relates_to)?,
                None => None,
            },
            FaultKind::UnknownSequence | FaultKind::SequenceTerminated => match &fault.sequence_id {
                Some(id) => self.ctx.registry.sending_by_wire_id(id)?,
                None => None,
            },
            _ => None,
        };
        if let Some(sequence) = affected {
            self.fail_sending_sequence(&sequence.internal_id, &fault.reason).await?;
        }

        self.ctx.listener.on_sequence_fault(fault).await;
        Ok(())
    }
}
