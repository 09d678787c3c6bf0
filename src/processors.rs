//! The [MessageProcessor]s for the message kinds that have a body the RM layer handles. RM
//!  headers (acks, ack requests, message pending) are handled before dispatch, so standalone
//!  acks and ack requests need no processing of their own.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{BackChannel, InvocationResponse, MessageProcessor};
use crate::fault::RmError;
use crate::lifecycle::SequenceLifecycle;
use crate::polling::PollingManager;
use crate::sequence_processor::SequenceProcessor;
use crate::util::random::Random;
use crate::wsrm::message::{RmBody, RmMessage, RmMessageKind};


fn unexpected_body(message: &RmMessage, kind: RmMessageKind) -> RmError {
    RmError::Internal(anyhow::anyhow!("message {} dispatched as {:?} has body {:?}", message.message_id, kind, message.body))
}

pub struct ApplicationProcessor {
    pub sequence_processor: Arc<SequenceProcessor>,
}

#[async_trait]
impl MessageProcessor for ApplicationProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::Application
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        self.sequence_processor.process_application(message, back_channel).await
    }
}

pub struct CreateSequenceProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for CreateSequenceProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::CreateSequence
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::CreateSequence(create) => self.lifecycle.accept_inbound_create(message, create, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct CreateSequenceResponseProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for CreateSequenceResponseProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::CreateSequenceResponse
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::CreateSequenceResponse(response) => self.lifecycle.on_create_sequence_response(message, response, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct TerminateSequenceProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for TerminateSequenceProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::TerminateSequence
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::TerminateSequence(terminate) => self.lifecycle.on_terminate_sequence(message, terminate, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct TerminateSequenceResponseProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for TerminateSequenceResponseProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::TerminateSequenceResponse
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::TerminateSequenceResponse(response) => self.lifecycle.on_terminate_sequence_response(message, response, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct CloseSequenceProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for CloseSequenceProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::CloseSequence
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::CloseSequence(close) => self.lifecycle.on_close_sequence(message, close, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct CloseSequenceResponseProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for CloseSequenceResponseProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::CloseSequenceResponse
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::CloseSequenceResponse(response) => self.lifecycle.on_close_sequence_response(message, response, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct MakeConnectionProcessor<R: Random> {
    pub polling: Arc<PollingManager<R>>,
}

#[async_trait]
impl <R: Random> MessageProcessor for MakeConnectionProcessor<R> {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::MakeConnection
    }

    async fn process_in(&self, message: &RmMessage, back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::MakeConnection(make_connection) => self.polling.process_make_connection(message, make_connection, back_channel).await,
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}

pub struct FaultProcessor {
    pub lifecycle: Arc<SequenceLifecycle>,
}

#[async_trait]
impl MessageProcessor for FaultProcessor {
    fn kind(&self) -> RmMessageKind {
        RmMessageKind::Fault
    }

    async fn process_in(&self, message: &RmMessage, _back_channel: &mut BackChannel) -> Result<InvocationResponse, RmError> {
        match &message.body {
            RmBody::Fault(fault) => {
                self.lifecycle.on_fault(message, fault).await?;
                Ok(InvocationResponse::Abort)
            }
            _ => Err(unexpected_body(message, self.kind())),
        }
    }
}
