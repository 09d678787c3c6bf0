//! The RM protocol elements, as they are carried in SOAP headers and bodies. Building and parsing
//!  the actual XML is the transport layer's business - these are the values the engine works on.

use std::time::Duration;

use anyhow::bail;

use crate::wsrm::endpoint::EndpointAddr;


/// `Sequence` header of an application message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceHeader {
    pub identifier: String,
    pub message_number: u64,
    /// `LastMessage` marker (WS-RM 1.0 only, but harmless to evaluate for 1.1)
    pub last_message: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AckRange {
    pub lower: u64,
    pub upper: u64,
}
impl AckRange {
    pub fn new(lower: u64, upper: u64) -> AckRange {
        AckRange { lower, upper }
    }
}

/// `SequenceAcknowledgement` header
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct SequenceAcknowledgement {
    pub identifier: String,
    pub ranges: Vec<AckRange>,
    pub nacks: Vec<u64>,
    /// `None` marker: nothing was received (yet)
    pub none: bool,
    /// `Final` marker: the receiver will not accept any further messages for this sequence
    pub final_ack: bool,
}

impl SequenceAcknowledgement {
    /// checks the structural rules for the element: ranges and nacks are mutually exclusive,
    ///  and `None` cannot be combined with ranges
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.ranges.is_empty() && !self.nacks.is_empty() {
            bail!("acknowledgement for {} has both ranges and nacks", self.identifier);
        }
        if self.none && !self.ranges.is_empty() {
            bail!("acknowledgement for {} has both 'None' and ranges", self.identifier);
        }
        Ok(())
    }
}

/// `AckRequested` header
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AckRequested {
    pub identifier: String,
    pub message_number: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SequenceOffer {
    pub identifier: String,
    /// mandatory for WS-RM 1.1, absent for 1.0
    pub endpoint: Option<EndpointAddr>,
    pub expires: Option<Duration>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequence {
    pub acks_to: EndpointAddr,
    pub offer: Option<SequenceOffer>,
    pub expires: Option<Duration>,
}

/// sent in a [CreateSequenceResponse] iff an offer was accepted
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Accept {
    /// where acknowledgements for the offered sequence go
    pub acks_to: EndpointAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateSequenceResponse {
    pub identifier: String,
    pub expires: Option<Duration>,
    pub accept: Option<Accept>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminateSequence {
    pub identifier: String,
    /// WS-RM 1.1 only
    pub last_message_number: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TerminateSequenceResponse {
    pub identifier: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseSequence {
    pub identifier: String,
    pub last_message_number: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseSequenceResponse {
    pub identifier: String,
}

/// a poll request: 'send me whatever is waiting for this address and / or sequence'
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MakeConnection {
    pub address: Option<EndpointAddr>,
    pub identifier: Option<String>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MessagePending {
    pub pending: bool,
}
