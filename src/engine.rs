use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ack::{AckOutcome, AcknowledgementEngine};
use crate::collaborators::{ApplicationListener, SecurityManager, Transport};
use crate::config::RmConfig;
use crate::context::RmContext;
use crate::dispatch::{BackChannel, Dispatcher, InvocationResponse};
use crate::fault::RmError;
use crate::invoker::InOrderInvoker;
use crate::lifecycle::{CreateSequenceRequest, SequenceLifecycle};
use crate::polling::PollingManager;
use crate::processors::{ApplicationProcessor, CloseSequenceProcessor, CloseSequenceResponseProcessor, CreateSequenceProcessor, CreateSequenceResponseProcessor, FaultProcessor, MakeConnectionProcessor, TerminateSequenceProcessor, TerminateSequenceResponseProcessor};
use crate::ranges::AckRangeSet;
use crate::scheduler::RetransmissionScheduler;
use crate::sequence_processor::SequenceProcessor;
use crate::store::records::SequenceState;
use crate::store::StorageManager;
use crate::util::random::RngRandom;
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{new_message_id, RmMessage, RmMessageKind, SecurityTokenRef};
use crate::wsrm::spec_version::SpecVersion;


/// An application message to send reliably
#[derive(Clone, Debug)]
pub struct SendRequest {
    /// the application's name for the sequence. The first message for an internal id creates
    ///  the sequence, using this request's addressing properties.
    pub internal_sequence_id: String,
    pub destination: EndpointAddr,
    /// anonymous if `None`: acks come back on the back channel of the application messages
    pub acks_to: Option<EndpointAddr>,
    pub reply_to: Option<EndpointAddr>,
    pub payload: Bytes,
    pub last_message: bool,
    /// offer the peer a sequence for the reverse direction
    pub offer: bool,
    pub version: Option<SpecVersion>,
    pub security_token: Option<SecurityTokenRef>,
}

impl SendRequest {
    pub fn new(internal_sequence_id: &str, destination: EndpointAddr, payload: Bytes) -> SendRequest {
        SendRequest {
            internal_sequence_id: internal_sequence_id.to_string(),
            destination,
            acks_to: None,
            reply_to: None,
            payload,
            last_message: false,
            offer: false,
            version: None,
            security_token: None,
        }
    }
}

/// What came out of processing an inbound message
#[derive(Debug)]
pub struct InboundOutcome {
    /// the message to return on the back channel, if any
    pub response: Option<RmMessage>,
    pub invocation: InvocationResponse,
}

/// A snapshot of a sequence's state, for monitoring
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceReport {
    pub internal_id: Option<String>,
    pub sequence_id: Option<String>,
    pub state: SequenceState,
    /// acknowledged message numbers for a sending sequence, received ones for a receiving
    ///  sequence
    pub completed: AckRangeSet,
    pub highest_message_number: u64,
    pub last_message_number: Option<u64>,
    pub closed: bool,
}

/// The reliable messaging engine: the entry point for sending application messages and for
///  processing everything that arrives from the transport. It owns the background workers.
pub struct RmEngine {
    ctx: Arc<RmContext>,
    lifecycle: Arc<SequenceLifecycle>,
    ack: Arc<AcknowledgementEngine>,
    polling: Arc<PollingManager>,
    scheduler: Arc<RetransmissionScheduler>,
    invoker: Arc<InOrderInvoker>,
    dispatcher: Dispatcher,
    cancel_sender: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RmEngine {
    pub fn new(
        config: RmConfig,
        storage: Arc<StorageManager>,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityManager>,
        listener: Arc<dyn ApplicationListener>,
    ) -> anyhow::Result<RmEngine> {
        config.validate()?;

        let ctx = Arc::new(RmContext::new(Arc::new(config), storage, transport, security, listener));
        let lifecycle = Arc::new(SequenceLifecycle::new(ctx.clone()));
        let ack = Arc::new(AcknowledgementEngine::new(ctx.clone()));
        let polling = Arc::new(PollingManager::<RngRandom>::new(ctx.clone()));
        let sequence_processor = Arc::new(SequenceProcessor::new(ctx.clone(), ack.clone()));

        let mut dispatcher = Dispatcher::default();
        dispatcher.register(Arc::new(ApplicationProcessor { sequence_processor }))?;
        dispatcher.register(Arc::new(CreateSequenceProcessor { lifecycle: lifecycle.clone() }))?;
        dispatcher.register(Arc::new(CreateSequenceResponseProcessor { lifecycle: lifecycle.clone() }))?;
        dispatcher.register(Arc::new(TerminateSequenceProcessor { lifecycle: lifecycle.clone() }))?;
        dispatcher.register(Arc::new(TerminateSequenceResponseProcessor { lifecycle: lifecycle.clone() }))?;
        dispatcher.register(Arc::new(CloseSequenceProcessor { lifecycle: lifecycle.clone() }))?;
        dispatcher.register(Arc::new(CloseSequenceResponseProcessor { lifecycle: lifecycle.clone() }))?;
        dispatcher.register(Arc::new(MakeConnectionProcessor { polling: polling.clone() }))?;
        dispatcher.register(Arc::new(FaultProcessor { lifecycle: lifecycle.clone() }))?;

        let (cancel_sender, _) = broadcast::channel(1);

        Ok(RmEngine {
            scheduler: Arc::new(RetransmissionScheduler::new(ctx.clone(), lifecycle.clone())),
            invoker: Arc::new(InOrderInvoker::new(ctx.clone())),
            ctx,
            lifecycle,
            ack,
            polling,
            dispatcher,
            cancel_sender,
            workers: Default::default(),
        })
    }

    pub fn config(&self) -> &RmConfig {
        &self.ctx.config
    }

    /// Spawns the background workers. They run until [RmEngine::shutdown] is called.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            warn!("engine is started already");
            return;
        }

        let scheduler = self.scheduler.clone();
        let cancel = self.cancel_sender.subscribe();
        workers.push(tokio::spawn(async move { scheduler.run(cancel).await }));

        let invoker = self.invoker.clone();
        let cancel = self.cancel_sender.subscribe();
        workers.push(tokio::spawn(async move { invoker.run(cancel).await }));
        info!("RM engine started");
    }

    /// Stops the background workers and waits for them to finish
    pub async fn shutdown(&self) {
        let _ = self.cancel_sender.send(());
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("worker terminated abnormally: {}", e);
            }
        }
        info!("RM engine shut down");
    }

    /// Queues an application message for reliable delivery, creating its sequence if necessary.
    ///  Returns the message number it was assigned. The message goes out asynchronously.
    pub async fn send(&self, request: SendRequest) -> Result<u64, RmError> {
        let internal_id = request.internal_sequence_id.clone();

        if self.ctx.registry.sending(&internal_id)?.is_none() {
            let create = CreateSequenceRequest {
                destination: request.destination.clone(),
                acks_to: request.acks_to.clone().unwrap_or_else(EndpointAddr::anonymous),
                reply_to: request.reply_to.clone(),
                offer: request.offer.then(new_message_id),
                version: request.version.unwrap_or(self.ctx.config.default_spec_version),
                security_token: request.security_token.clone(),
            };
            match self.lifecycle.create_sequence(&internal_id, create).await {
                Ok(_) => {}
                Err(RmError::SequenceExists(_)) => debug!("sequence {} was created concurrently", internal_id),
                Err(e) => return Err(e),
            }
        }

        self.ctx.registry.allocate_message(&internal_id, request.payload, request.last_message, Instant::now()).await
    }

    /// Creates a sending sequence explicitly, e.g. to offer a reverse sequence before the first
    ///  message is sent
    pub async fn create_sequence(&self, internal_id: &str, request: CreateSequenceRequest) -> Result<(), RmError> {
        self.lifecycle.create_sequence(internal_id, request).await?;
        Ok(())
    }

    pub async fn terminate_sequence(&self, internal_id: &str) -> Result<(), RmError> {
        self.lifecycle.request_termination(internal_id).await
    }

    pub async fn close_sequence(&self, internal_id: &str) -> Result<(), RmError> {
        self.lifecycle.close_sequence(internal_id).await
    }

    pub async fn request_ack(&self, internal_id: &str) -> Result<(), RmError> {
        self.ack.request_ack(internal_id).await
    }

    /// Processes a message that arrived from the transport. RM headers are handled first, then
    ///  the message is dispatched by its kind. Messages without any RM content are handed back
    ///  to the transport's regular inbound pipeline.
    pub async fn process_inbound(&self, message: RmMessage, mut back_channel: BackChannel) -> Result<InboundOutcome, RmError> {
        let kind = message.kind();
        debug!(?kind, "processing inbound message {}", message.message_id);

        let invocation = self.process_inbound_internal(kind, &message, &mut back_channel).await?;
        if kind == RmMessageKind::NonReliable && invocation != InvocationResponse::Abort {
            self.ctx.transport.deliver_inbound(message).await;
        }

        Ok(InboundOutcome {
            response: back_channel.take_response(),
            invocation,
        })
    }

    async fn process_inbound_internal(&self, kind: RmMessageKind, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        if self.process_acks(message, back_channel).await? == InvocationResponse::Abort {
            return Ok(InvocationResponse::Abort);
        }
        self.polling.process_message_pending(message)?;

        match kind {
            RmMessageKind::Ack => Ok(InvocationResponse::Abort),
            RmMessageKind::AckRequest => {
                self.process_ack_requests(message, back_channel).await?;
                Ok(InvocationResponse::Abort)
            }
            RmMessageKind::NonReliable => Ok(InvocationResponse::Continue),
            _ => {
                let Some(processor) = self.dispatcher.get(kind) else {
                    warn!("no processor for {:?} message {} - dropping it", kind, message.message_id);
                    return Ok(InvocationResponse::Abort);
                };
                let invocation = processor.process_in(message, back_channel).await?;
                if invocation == InvocationResponse::Abort {
                    return Ok(invocation);
                }
                match self.process_ack_requests(message, back_channel).await? {
                    InvocationResponse::Abort => Ok(InvocationResponse::Abort),
                    _ => Ok(invocation),
                }
            }
        }
    }

    async fn process_acks(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        for ack in &message.headers.acks {
            match self.ack.process_inbound_ack(message, ack, back_channel).await? {
                AckOutcome::Faulted => return Ok(InvocationResponse::Abort),
                AckOutcome::Processed { internal_id, complete, .. } => {
                    if complete && self.ctx.config.auto_terminate {
                        self.auto_terminate(&internal_id).await;
                    }
                }
            }
        }
        Ok(InvocationResponse::Continue)
    }

    async fn process_ack_requests(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        for ack_requested in &message.headers.ack_requests {
            if self.ack.process_ack_requested(message, ack_requested, back_channel).await? == InvocationResponse::Abort {
                return Ok(InvocationResponse::Abort);
            }
        }
        Ok(InvocationResponse::Continue)
    }

    async fn auto_terminate(&self, internal_id: &str) {
        match self.lifecycle.request_termination(internal_id).await {
            Ok(()) => debug!("all messages of {} are acknowledged, terminating it", internal_id),
            Err(e) => debug!("not terminating {}: {}", internal_id, e),
        }
    }

    pub fn outgoing_sequence_report(&self, internal_id: &str) -> Result<Option<SequenceReport>, RmError> {
        Ok(self.ctx.registry.sending(internal_id)?
            .map(|s| SequenceReport {
                internal_id: Some(s.internal_id),
                sequence_id: s.wire_id,
                state: s.state,
                completed: s.acked,
                highest_message_number: s.highest_message_number,
                last_message_number: s.last_message_number,
                closed: s.closed,
            }))
    }

    pub fn incoming_sequence_report(&self, sequence_id: &str) -> Result<Option<SequenceReport>, RmError> {
        Ok(self.ctx.registry.receiving(sequence_id)?
            .map(|s| SequenceReport {
                internal_id: None,
                sequence_id: Some(s.wire_id),
                state: s.state,
                completed: s.received,
                highest_message_number: s.highest_message_number,
                last_message_number: s.last_message_number,
                closed: s.closed,
            }))
    }

    /// reports for all receiving sequences, e.g. to find the ids the peers picked
    pub fn incoming_sequence_reports(&self) -> Result<Vec<SequenceReport>, RmError> {
        let mut ids = self.ctx.storage.receiving.find(&|_| true)?
            .into_iter()
            .map(|s| s.wire_id)
            .collect::<Vec<_>>();
        ids.sort();

        let mut result = Vec::new();
        for id in ids {
            if let Some(report) = self.incoming_sequence_report(&id)? {
                result.push(report);
            }
        }
        Ok(result)
    }
}
