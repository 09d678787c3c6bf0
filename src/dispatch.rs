use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::context::RmContext;
use crate::fault::{RmError, RmFault};
use crate::store::records::{SendTask, TaskKind};
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{RmBody, RmMessage, RmMessageKind};


/// What should happen to an inbound message after the RM layer processed it
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InvocationResponse {
    /// processing completed normally
    Continue,
    /// the message was stored and will be handed to the application later
    Suspend,
    /// processing stops here: the message was consumed by the RM layer, was a duplicate, or
    ///  caused a fault
    Abort,
}

/// The response path of the connection an inbound message arrived on, e.g. an HTTP response.
///  It can carry at most one message.
#[derive(Debug)]
pub struct BackChannel {
    available: bool,
    response: Option<RmMessage>,
}

impl BackChannel {
    /// the back channel of a request / response transport
    pub fn available() -> BackChannel {
        BackChannel {
            available: true,
            response: None,
        }
    }

    /// one-way transports have no back channel
    pub fn none() -> BackChannel {
        BackChannel {
            available: false,
            response: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.available && self.response.is_none()
    }

    /// returns the message if the back channel is not free
    pub fn respond(&mut self, message: RmMessage) -> Result<(), RmMessage> {
        if !self.is_free() {
            return Err(message);
        }
        self.response = Some(message);
        Ok(())
    }

    pub fn response(&self) -> Option<&RmMessage> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<RmMessage> {
        self.response.take()
    }
}

/// Handles inbound messages of one [RmMessageKind]
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    fn kind(&self) -> RmMessageKind;

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError>;
}

/// The table of message processors, keyed by the message kind they handle
#[derive(Default)]
pub struct Dispatcher {
    processors: FxHashMap<RmMessageKind, Arc<dyn MessageProcessor>>,
}

impl Dispatcher {
    pub fn register(&mut self, processor: Arc<dyn MessageProcessor>) -> anyhow::Result<()> {
        match self.processors.entry(processor.kind()) {
            Entry::Occupied(_) => {
                return Err(anyhow::anyhow!("registering a second processor for kind {:?}", processor.kind()));
            }
            Entry::Vacant(e) => {
                debug!("registering processor for kind {:?}", processor.kind());
                e.insert(processor);
            }
        }
        Ok(())
    }

    pub fn get(&self, kind: RmMessageKind) -> Option<Arc<dyn MessageProcessor>> {
        self.processors.get(&kind).cloned()
    }
}

/// Sends a fault back to the peer over the channel the offending message arrived on. If that
///  channel can not take it, the fault goes to the message's reply-to address.
///
/// Always returns [InvocationResponse::Abort] since the offending message is not processed
///  any further.
pub async fn send_fault(ctx: &RmContext, back_channel: &mut BackChannel, request: &RmMessage, fault: RmFault) -> InvocationResponse {
    debug!("sending fault in response to {}: {}", request.message_id, fault);

    let fault_message = RmMessage::new(request.version, RmBody::Fault(fault))
        .with_relates_to(&request.message_id);
    let fault_message = match back_channel.respond(fault_message) {
        Ok(()) => return InvocationResponse::Abort,
        Err(msg) => msg,
    };

    match &request.reply_to {
        Some(reply_to) if !reply_to.is_anonymous() => {
            let fault_message = fault_message.with_to(reply_to.clone());
            if let Err(e) = ctx.transport.send(reply_to, fault_message).await {
                warn!("failed to send fault to {}: {}", reply_to, e);
            }
        }
        _ => {
            warn!("no channel to send fault for {} - dropping it", request.message_id);
        }
    }
    InvocationResponse::Abort
}

/// Delivers a protocol response (CreateSequenceResponse, TerminateSequenceResponse etc.) to
///  where the request's reply-to address says:
///  * no or anonymous reply-to: the back channel
///  * RM anonymous reply-to: parked until the peer polls for it
///  * anything else: sent directly
///
/// `sequence_ref` is the wire id of the receiving sequence the response belongs to.
pub async fn deliver_reply(ctx: &RmContext, back_channel: &mut BackChannel, request: &RmMessage, reply: RmMessage, sequence_ref: &str) -> anyhow::Result<()> {
    let reply_to = request.reply_to.clone()
        .unwrap_or_else(EndpointAddr::anonymous);
    let reply = reply.with_to(reply_to.clone());

    if reply_to.is_rm_anonymous() {
        debug!("parking reply {} for {} until it is polled", reply.message_id, reply_to);
        let mut task = SendTask::new(TaskKind::MakeConnectionResponse, sequence_ref, reply_to, Instant::now());
        task.message_id = reply.message_id.clone();
        task.resend = false;
        task.message_key = Some(ctx.storage.store_message(reply)?);
        ctx.storage.send_tasks.insert(task)?;
    }
    else if reply_to.is_anonymous() {
        if let Err(reply) = back_channel.respond(reply) {
            error!("back channel is not available for reply {} - dropping it", reply.message_id);
        }
    }
    else if let Err(e) = ctx.transport.send(&reply_to, reply).await {
        warn!("failed to send reply to {}: {}", reply_to, e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::collaborators::{MockTransport, NoSecurity};
    use crate::fault::FaultKind;
    use crate::store::StorageManager;
    use crate::test_util::listener::RecordingListener;
    use crate::test_util::{test_config, test_context};
    use crate::test_util::transport::TrackingTransport;
    use crate::wsrm::spec_version::SpecVersion;

    struct DummyProcessor {
        kind: RmMessageKind,
    }

    #[async_trait]
    impl MessageProcessor for DummyProcessor {
        fn kind(&self) -> RmMessageKind {
            self.kind
        }

        async fn process_in(&self, _message: &RmMessage, _back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
            Ok(InvocationResponse::Continue)
        }
    }

    #[test]
    fn test_register_twice() {
        let mut dispatcher = Dispatcher::default();
        dispatcher.register(Arc::new(DummyProcessor { kind: RmMessageKind::Ack })).unwrap();
        dispatcher.register(Arc::new(DummyProcessor { kind: RmMessageKind::Fault })).unwrap();
        assert!(dispatcher.register(Arc::new(DummyProcessor { kind: RmMessageKind::Ack })).is_err());

        assert!(dispatcher.get(RmMessageKind::Ack).is_some());
        assert!(dispatcher.get(RmMessageKind::Application).is_none());
    }

    #[test]
    fn test_back_channel() {
        let mut none = BackChannel::none();
        assert!(!none.is_free());
        assert!(none.respond(RmMessage::new(SpecVersion::V1_0, RmBody::Empty)).is_err());

        let mut available = BackChannel::available();
        assert!(available.is_free());
        available.respond(RmMessage::new(SpecVersion::V1_0, RmBody::Empty)).unwrap();
        assert!(!available.is_free());
        assert!(available.respond(RmMessage::new(SpecVersion::V1_0, RmBody::Empty)).is_err());
        assert!(available.take_response().is_some());
        assert!(available.is_free());
    }

    #[rstest]
    #[case::back_channel(true, None, true, false)]
    #[case::reply_to(false, Some("http://peer"), false, true)]
    #[case::anonymous_without_back_channel(false, None, false, false)]
    #[tokio::test]
    async fn test_send_fault(#[case] has_back_channel: bool, #[case] reply_to: Option<&str>, #[case] expect_back_channel: bool, #[case] expect_sent: bool) {
        let transport = Arc::new(TrackingTransport::new());
        let ctx = test_context(transport.clone());
        let mut back_channel = if has_back_channel { BackChannel::available() } else { BackChannel::none() };

        let request = RmMessage::new(SpecVersion::V1_1, RmBody::Empty)
            .with_reply_to(reply_to.map(EndpointAddr::new));
        let result = send_fault(&ctx, &mut back_channel, &request, RmFault::unknown_sequence("x")).await;
        assert_eq!(result, InvocationResponse::Abort);

        match back_channel.take_response() {
            Some(msg) => {
                assert!(expect_back_channel);
                assert_eq!(msg.relates_to.as_deref(), Some(request.message_id.as_str()));
                assert!(matches!(msg.body, RmBody::Fault(RmFault { kind: FaultKind::UnknownSequence, .. })));
            }
            None => assert!(!expect_back_channel),
        }
        assert_eq!(transport.sent().len(), if expect_sent { 1 } else { 0 });
    }

    #[tokio::test]
    async fn test_send_fault_to_reply_to_ignores_send_failure() {
        let mut transport = MockTransport::new();
        transport.expect_send()
            .once()
            .withf(|to, message| to == &EndpointAddr::new("http://peer/faults") && matches!(message.body, RmBody::Fault(_)))
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));
        let ctx = RmContext::new(Arc::new(test_config()), Arc::new(StorageManager::in_memory()), Arc::new(transport), Arc::new(NoSecurity {}), Arc::new(RecordingListener::default()));

        let request = RmMessage::new(SpecVersion::V1_1, RmBody::Empty)
            .with_reply_to(Some(EndpointAddr::new("http://peer/faults")));
        let result = send_fault(&ctx, &mut BackChannel::none(), &request, RmFault::unknown_sequence("x")).await;
        assert_eq!(result, InvocationResponse::Abort);
    }

    #[rstest]
    #[case::anonymous(None, true, 0, 0)]
    #[case::rm_anonymous(Some("http://docs.oasis-open.org/ws-rx/wsmc/200702/anonymous?id=abc"), false, 0, 1)]
    #[case::addressable(Some("http://peer"), false, 1, 0)]
    #[tokio::test]
    async fn test_deliver_reply(#[case] reply_to: Option<&str>, #[case] expect_back_channel: bool, #[case] expect_sent: usize, #[case] expect_parked: usize) {
        let transport = Arc::new(TrackingTransport::new());
        let ctx = test_context(transport.clone());
        let mut back_channel = BackChannel::available();

        let request = RmMessage::new(SpecVersion::V1_1, RmBody::Empty)
            .with_reply_to(reply_to.map(EndpointAddr::new));
        let reply = RmMessage::new(SpecVersion::V1_1, RmBody::Empty);
        deliver_reply(&ctx, &mut back_channel, &request, reply, "seq").await.unwrap();

        assert_eq!(back_channel.response().is_some(), expect_back_channel);
        assert_eq!(transport.sent().len(), expect_sent);

        let parked = ctx.storage.send_tasks.find(&|t| t.kind == TaskKind::MakeConnectionResponse).unwrap();
        assert_eq!(parked.len(), expect_parked);
        assert!(parked.iter().all(|t| !t.transport_available && !t.resend && t.sequence_ref == "seq"));
    }
}
