use bytes::Bytes;

use crate::fault::RmFault;
use crate::wsrm::elements::{AckRequested, CloseSequence, CloseSequenceResponse, CreateSequence, CreateSequenceResponse, MakeConnection, MessagePending, SequenceAcknowledgement, SequenceHeader, TerminateSequence, TerminateSequenceResponse};
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::spec_version::SpecVersion;


/// Opaque reference to a security token (e.g. a WS-SecureConversation context id) that a
///  sequence is bound to. Interpreting it is the [crate::collaborators::SecurityManager]'s job.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct SecurityTokenRef(pub String);

/// RM related SOAP headers. Acknowledgements and ack requests can be piggy-backed on any message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RmHeaders {
    pub sequence: Option<SequenceHeader>,
    pub acks: Vec<SequenceAcknowledgement>,
    pub ack_requests: Vec<AckRequested>,
    pub message_pending: Option<MessagePending>,
}

impl RmHeaders {
    pub fn is_empty(&self) -> bool {
        self.sequence.is_none() && self.acks.is_empty() && self.ack_requests.is_empty() && self.message_pending.is_none()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RmBody {
    /// no body, e.g. a standalone acknowledgement
    Empty,
    Application(Bytes),
    CreateSequence(CreateSequence),
    CreateSequenceResponse(CreateSequenceResponse),
    TerminateSequence(TerminateSequence),
    TerminateSequenceResponse(TerminateSequenceResponse),
    CloseSequence(CloseSequence),
    CloseSequenceResponse(CloseSequenceResponse),
    MakeConnection(MakeConnection),
    Fault(RmFault),
}

/// The kind of an RM message, which is what inbound processing dispatches on
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RmMessageKind {
    Application,
    CreateSequence,
    CreateSequenceResponse,
    TerminateSequence,
    TerminateSequenceResponse,
    CloseSequence,
    CloseSequenceResponse,
    /// standalone SequenceAcknowledgement
    Ack,
    /// standalone AckRequested
    AckRequest,
    MakeConnection,
    Fault,
    /// a message without any RM content, e.g. a regular request on an unreliable binding
    NonReliable,
}

/// An RM message: addressing properties, RM headers and body. This is the unit that is handed to
///  and received from the transport layer, which takes care of the actual SOAP envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RmMessage {
    pub version: SpecVersion,
    pub message_id: String,
    pub to: Option<EndpointAddr>,
    pub reply_to: Option<EndpointAddr>,
    pub relates_to: Option<String>,
    pub headers: RmHeaders,
    pub body: RmBody,
    /// the token that the message was signed with, if any
    pub security_token: Option<SecurityTokenRef>,
}

pub fn new_message_id() -> String {
    format!("urn:uuid:{}", uuid::Uuid::new_v4())
}

impl RmMessage {
    pub fn new(version: SpecVersion, body: RmBody) -> RmMessage {
        RmMessage {
            version,
            message_id: new_message_id(),
            to: None,
            reply_to: None,
            relates_to: None,
            headers: RmHeaders::default(),
            body,
            security_token: None,
        }
    }

    pub fn with_to(mut self, to: EndpointAddr) -> RmMessage {
        self.to = Some(to);
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<EndpointAddr>) -> RmMessage {
        self.reply_to = reply_to;
        self
    }

    pub fn with_relates_to(mut self, relates_to: &str) -> RmMessage {
        self.relates_to = Some(relates_to.to_string());
        self
    }

    pub fn kind(&self) -> RmMessageKind {
        match &self.body {
            RmBody::Application(_) if self.headers.sequence.is_some() => RmMessageKind::Application,
            RmBody::Application(_) => RmMessageKind::NonReliable,
            RmBody::CreateSequence(_) => RmMessageKind::CreateSequence,
            RmBody::CreateSequenceResponse(_) => RmMessageKind::CreateSequenceResponse,
            RmBody::TerminateSequence(_) => RmMessageKind::TerminateSequence,
            RmBody::TerminateSequenceResponse(_) => RmMessageKind::TerminateSequenceResponse,
            RmBody::CloseSequence(_) => RmMessageKind::CloseSequence,
            RmBody::CloseSequenceResponse(_) => RmMessageKind::CloseSequenceResponse,
            RmBody::MakeConnection(_) => RmMessageKind::MakeConnection,
            RmBody::Fault(_) => RmMessageKind::Fault,
            RmBody::Empty => {
                // a sequence header on an empty body is a WS-RM 1.0 'LastMessage' carrier
                if self.headers.sequence.is_some() {
                    RmMessageKind::Application
                }
                else if !self.headers.acks.is_empty() {
                    RmMessageKind::Ack
                }
                else if !self.headers.ack_requests.is_empty() {
                    RmMessageKind::AckRequest
                }
                else {
                    RmMessageKind::NonReliable
                }
            }
        }
    }

    /// the WS-Addressing action for this message, if it is an RM protocol message
    pub fn action(&self) -> Option<String> {
        let element = match self.kind() {
            RmMessageKind::CreateSequence => "CreateSequence",
            RmMessageKind::CreateSequenceResponse => "CreateSequenceResponse",
            RmMessageKind::TerminateSequence => "TerminateSequence",
            RmMessageKind::TerminateSequenceResponse => "TerminateSequenceResponse",
            RmMessageKind::CloseSequence => "CloseSequence",
            RmMessageKind::CloseSequenceResponse => "CloseSequenceResponse",
            RmMessageKind::Ack => "SequenceAcknowledgement",
            RmMessageKind::AckRequest => "AckRequested",
            RmMessageKind::MakeConnection => "MakeConnection",
            RmMessageKind::Fault => "fault",
            RmMessageKind::Application | RmMessageKind::NonReliable => return None,
        };
        Some(self.version.action(element))
    }
}
