//! The records the engine persists. The store is the single source of truth for protocol state -
//!  all components re-read what they need from it rather than caching sequence state in memory.

use tokio::time::Instant;

use crate::ranges::AckRangeSet;
use crate::store::Record;
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{RmMessage, SecurityTokenRef};
use crate::wsrm::spec_version::SpecVersion;


/// Lifecycle state of a sequence, the same for both sides
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SequenceState {
    /// CreateSequence was sent (sending side), no response yet
    Creating,
    Established,
    /// no new messages are accepted, acknowledgement state is still live
    Closing,
    /// TerminateSequence is scheduled or sent, waiting for it to complete
    Terminating,
    Terminated,
}

impl SequenceState {
    /// true if the sequence accepts new application messages
    pub fn accepts_messages(&self) -> bool {
        matches!(self, SequenceState::Creating | SequenceState::Established)
    }
}

/// The sending side of a sequence, keyed by the locally generated internal sequence id
#[derive(Clone, Debug)]
pub struct SendingSequence {
    pub internal_id: String,
    /// assigned by the peer in its CreateSequenceResponse
    pub wire_id: Option<String>,
    pub version: SpecVersion,
    pub state: SequenceState,
    pub destination: EndpointAddr,
    pub acks_to: EndpointAddr,
    pub reply_to: Option<EndpointAddr>,
    /// highest message number that was allocated so far, 0 before the first message
    pub highest_message_number: u64,
    pub last_message_number: Option<u64>,
    pub closed: bool,
    pub acked: AckRangeSet,
    /// id of a sequence that this side offered to the peer for the reverse direction
    pub offered_sequence_id: Option<String>,
    pub security_token: Option<SecurityTokenRef>,
    /// true if acks for this sequence can only be delivered on a poll
    pub polling_mode: bool,
    /// message id of the CreateSequence message, to correlate the response
    pub create_sequence_message_id: Option<String>,
    /// guard against a second TerminateSequence task for the same sequence
    pub terminate_added: bool,
    pub last_activity: Instant,
    pub terminated_at: Option<Instant>,
}

impl SendingSequence {
    pub fn is_terminated(&self) -> bool {
        self.state == SequenceState::Terminated
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// true iff the last message number is known and everything up to it is acknowledged
    pub fn is_complete(&self) -> bool {
        match self.last_message_number {
            Some(last) => self.acked.complete_up_to(last),
            None => false,
        }
    }
}

impl Record for SendingSequence {
    type Key = String;

    fn key(&self) -> String {
        self.internal_id.clone()
    }
}

/// The receiving side of a sequence, keyed by its wire id
#[derive(Clone, Debug)]
pub struct ReceivingSequence {
    pub wire_id: String,
    pub version: SpecVersion,
    pub state: SequenceState,
    pub acks_to: EndpointAddr,
    /// the address the peer sends this sequence's messages to, i.e. ourselves
    pub to: Option<EndpointAddr>,
    pub highest_message_number: u64,
    pub highest_message_id: Option<String>,
    pub last_message_id: Option<String>,
    pub last_message_number: Option<u64>,
    pub received: AckRangeSet,
    /// number of the next message to hand to the application in in-order mode
    pub next_to_invoke: u64,
    pub closed: bool,
    pub security_token: Option<SecurityTokenRef>,
    pub polling_mode: bool,
    /// internal id of the sending sequence that was created from this sequence's offer
    pub outbound_internal_id: Option<String>,
    pub last_activity: Instant,
    pub terminated_at: Option<Instant>,
}

impl ReceivingSequence {
    pub fn is_terminated(&self) -> bool {
        self.state == SequenceState::Terminated
    }
}

impl Record for ReceivingSequence {
    type Key = String;

    fn key(&self) -> String {
        self.wire_id.clone()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TaskKind {
    Application,
    CreateSequence,
    Ack,
    AckRequest,
    TerminateSequence,
    CloseSequence,
    /// a poll request sent by this side
    MakeConnection,
    /// a reply for an RM-anonymous endpoint, waiting to be picked up by a poll
    MakeConnectionResponse,
}

/// Something that has to go out on the wire, and possibly be re-sent until acknowledged
#[derive(Clone, Debug)]
pub struct SendTask {
    pub message_id: String,
    pub kind: TaskKind,
    /// internal id for sending side tasks, wire id of the receiving sequence for acks
    pub sequence_ref: String,
    pub message_number: Option<u64>,
    pub next_send_time: Instant,
    /// false while the task must not be sent, e.g. application messages before the
    ///  sequence is established
    pub send: bool,
    /// false if the destination is not reachable, i.e. the task can only be sent in reply
    ///  to a MakeConnection poll
    pub transport_available: bool,
    /// false for tasks that go out once (acks, poll requests, responses) and are removed
    ///  afterwards
    pub resend: bool,
    pub destination: EndpointAddr,
    /// key of the stored message in [crate::store::StorageManager::messages]
    pub message_key: Option<String>,
    pub sent_count: u32,
    pub created_at: Instant,
    pub first_sent_at: Option<Instant>,
}

impl SendTask {
    pub fn new(kind: TaskKind, sequence_ref: &str, destination: EndpointAddr, now: Instant) -> SendTask {
        SendTask {
            message_id: crate::wsrm::message::new_message_id(),
            kind,
            sequence_ref: sequence_ref.to_string(),
            message_number: None,
            next_send_time: now,
            send: true,
            transport_available: !destination.is_rm_anonymous(),
            resend: true,
            destination,
            message_key: None,
            sent_count: 0,
            created_at: now,
            first_sent_at: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.send && self.transport_available && self.next_send_time <= now
    }
}

impl Record for SendTask {
    type Key = String;

    fn key(&self) -> String {
        self.message_id.clone()
    }
}

/// An inbound application message waiting for its turn in in-order delivery
#[derive(Clone, Debug)]
pub struct InvocationTask {
    pub message_key: String,
    pub sequence_id: String,
    pub message_number: u64,
}

impl Record for InvocationTask {
    type Key = String;

    fn key(&self) -> String {
        self.message_key.clone()
    }
}

/// A stored message body, referenced by tasks
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub key: String,
    pub message: RmMessage,
}

impl Record for StoredMessage {
    type Key = String;

    fn key(&self) -> String {
        self.key.clone()
    }
}
