use std::fmt::{Debug, Formatter};

use thiserror::Error;

use crate::wsrm::elements::AckRange;


/// SOAP fault code: whose fault it is
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultCode {
    Sender,
    Receiver,
}

/// The WS-RM fault taxonomy. Faults are protocol messages: they are sent back to the peer on
///  the channel the offending message arrived on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FaultKind {
    UnknownSequence,
    SequenceTerminated,
    SequenceClosed,
    InvalidAcknowledgement,
    CreateSequenceRefused,
    MessageNumberRollover,
    LastMessageNumberExceeded,
}

impl FaultKind {
    /// local name of the fault subcode, qualified with the RM namespace on the wire
    pub fn subcode(&self) -> &'static str {
        match self {
            FaultKind::UnknownSequence => "UnknownSequence",
            FaultKind::SequenceTerminated => "SequenceTerminated",
            FaultKind::SequenceClosed => "SequenceClosed",
            FaultKind::InvalidAcknowledgement => "InvalidAcknowledgement",
            FaultKind::CreateSequenceRefused => "CreateSequenceRefused",
            FaultKind::MessageNumberRollover => "MessageNumberRollover",
            FaultKind::LastMessageNumberExceeded => "LastMessageNumberExceeded",
        }
    }

    pub fn code(&self) -> FaultCode {
        match self {
            FaultKind::MessageNumberRollover => FaultCode::Receiver,
            _ => FaultCode::Sender,
        }
    }

    pub fn from_subcode(subcode: &str) -> Option<FaultKind> {
        let local_name = subcode.rsplit(':').next().unwrap_or(subcode);
        [
            FaultKind::UnknownSequence,
            FaultKind::SequenceTerminated,
            FaultKind::SequenceClosed,
            FaultKind::InvalidAcknowledgement,
            FaultKind::CreateSequenceRefused,
            FaultKind::MessageNumberRollover,
            FaultKind::LastMessageNumberExceeded,
        ].into_iter()
            .find(|k| k.subcode() == local_name)
    }
}

/// fault detail, i.e. the RM element that caused the fault
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FaultDetail {
    Identifier(String),
    /// the offending acknowledgement range
    AckRange { identifier: String, range: AckRange },
    /// the offending message number
    MessageNumber { identifier: String, message_number: u64 },
}

#[derive(Clone, Eq, PartialEq, Error)]
#[error("{kind:?} fault for sequence {sequence_id:?}: {reason}")]
pub struct RmFault {
    pub kind: FaultKind,
    pub sequence_id: Option<String>,
    pub reason: String,
    pub detail: Option<FaultDetail>,
}

impl Debug for RmFault {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RmFault{{{:?}, seq={:?}, {:?}}}", self.kind, self.sequence_id, self.reason)
    }
}

impl RmFault {
    pub fn unknown_sequence(sequence_id: &str) -> RmFault {
        RmFault {
            kind: FaultKind::UnknownSequence,
            sequence_id: Some(sequence_id.to_string()),
            reason: format!("the value of wsrm:Identifier is not a known sequence identifier: {}", sequence_id),
            detail: Some(FaultDetail::Identifier(sequence_id.to_string())),
        }
    }

    pub fn sequence_terminated(sequence_id: &str, reason: impl Into<String>) -> RmFault {
        RmFault {
            kind: FaultKind::SequenceTerminated,
            sequence_id: Some(sequence_id.to_string()),
            reason: reason.into(),
            detail: Some(FaultDetail::Identifier(sequence_id.to_string())),
        }
    }

    pub fn sequence_closed(sequence_id: &str) -> RmFault {
        RmFault {
            kind: FaultKind::SequenceClosed,
            sequence_id: Some(sequence_id.to_string()),
            reason: format!("sequence {} is closed and does not accept new messages", sequence_id),
            detail: Some(FaultDetail::Identifier(sequence_id.to_string())),
        }
    }

    pub fn invalid_acknowledgement(sequence_id: &str, range: AckRange) -> RmFault {
        RmFault {
            kind: FaultKind::InvalidAcknowledgement,
            sequence_id: Some(sequence_id.to_string()),
            reason: format!("acknowledgement range [{},{}] violates the cardinality of sent messages", range.lower, range.upper),
            detail: Some(FaultDetail::AckRange { identifier: sequence_id.to_string(), range }),
        }
    }

    pub fn create_sequence_refused(reason: impl Into<String>) -> RmFault {
        RmFault {
            kind: FaultKind::CreateSequenceRefused,
            sequence_id: None,
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn message_number_rollover(sequence_id: &str, message_number: u64) -> RmFault {
        RmFault {
            kind: FaultKind::MessageNumberRollover,
            sequence_id: Some(sequence_id.to_string()),
            reason: format!("message number {} exceeds the maximum message number", message_number),
            detail: Some(FaultDetail::MessageNumber { identifier: sequence_id.to_string(), message_number }),
        }
    }

    pub fn last_message_number_exceeded(sequence_id: &str, message_number: u64, last_message_number: u64) -> RmFault {
        RmFault {
            kind: FaultKind::LastMessageNumberExceeded,
            sequence_id: Some(sequence_id.to_string()),
            reason: format!("message number {} is larger than the last message number {}", message_number, last_message_number),
            detail: Some(FaultDetail::MessageNumber { identifier: sequence_id.to_string(), message_number }),
        }
    }
}


/// Errors reported to local callers of the engine's API. These never go on the wire - a
///  send against a closed sequence e.g. is rejected before any network interaction.
#[derive(Debug, Error)]
pub enum RmError {
    #[error("unknown sequence {0}")]
    UnknownSequence(String),
    #[error("sequence {0} is closed")]
    SequenceClosed(String),
    #[error("sequence {0} is terminated")]
    SequenceTerminated(String),
    #[error("sequence {0} exists already")]
    SequenceExists(String),
    #[error("sequence {0} is not established yet")]
    NotEstablished(String),
    #[error("sequence {sequence_id} can not be terminated: messages up to {last_message_number} are not all acknowledged")]
    TerminationRefused { sequence_id: String, last_message_number: u64 },
    #[error("sequence {0} ran out of message numbers")]
    MessageNumberRollover(String),
    #[error("sequence {0} had its last message already")]
    LastMessageNumberExceeded(String),
    #[error("security verification failed: {0}")]
    Security(anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
