//! The engine's seams to the surrounding system: the transport that moves messages, the
//!  security layer that verifies token possession, and the application that consumes delivered
//!  messages. All of them are traits so they can be mocked away in tests.

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

use crate::fault::RmFault;
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{RmMessage, SecurityTokenRef};


#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// sends a message to a reachable endpoint. This may block for network I/O, so it is only
    ///  called from background workers and from processing of inbound messages.
    async fn send(&self, to: &EndpointAddr, message: RmMessage) -> anyhow::Result<()>;

    /// hands a message that the RM layer has no business with back to the regular inbound
    ///  processing pipeline
    async fn deliver_inbound(&self, message: RmMessage);
}

/// The part of a message that a proof-of-possession check covers
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SignedElement {
    SequenceHeader,
    SequenceAcknowledgement,
    AckRequested,
    Body,
}

#[cfg_attr(test, automock)]
pub trait SecurityManager: Send + Sync + 'static {
    /// verifies that the sender of `message` holds `token` and used it to sign `element`. An
    ///  error means the message must be rejected.
    fn check_proof_of_possession(&self, token: &SecurityTokenRef, element: SignedElement, message: &RmMessage) -> anyhow::Result<()>;
}

/// [SecurityManager] for deployments without message level security: sequences are never bound
///  to a token, so there is nothing to check
pub struct NoSecurity {}

impl SecurityManager for NoSecurity {
    fn check_proof_of_possession(&self, _token: &SecurityTokenRef, _element: SignedElement, _message: &RmMessage) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeliveryFailure {
    pub internal_sequence_id: String,
    /// `None` if the failure affects the sequence as a whole, e.g. a refused CreateSequence
    pub message_number: Option<u64>,
    pub reason: String,
}

/// The application side: this is where delivered messages and faults end up.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplicationListener: Send + Sync + 'static {
    /// called exactly once per message number of a sequence
    async fn on_sequence_message(&self, sequence_id: &str, message_number: u64, payload: Bytes);

    async fn on_sequence_fault(&self, fault: &RmFault);

    async fn on_delivery_failure(&self, failure: DeliveryFailure);
}
