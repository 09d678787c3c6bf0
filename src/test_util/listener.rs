use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::collaborators::{ApplicationListener, DeliveryFailure};
use crate::fault::RmFault;


/// An [ApplicationListener] that records what it is handed
#[derive(Debug, Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<(String, u64, Bytes)>>,
    faults: Mutex<Vec<RmFault>>,
    failures: Mutex<Vec<DeliveryFailure>>,
}

impl RecordingListener {
    pub fn messages(&self) -> Vec<(String, u64, Bytes)> {
        self.messages.lock().unwrap().clone()
    }

    /// the message numbers delivered for a sequence, in delivery order
    pub fn message_numbers(&self, sequence_id: &str) -> Vec<u64> {
        self.messages.lock().unwrap()
            .iter()
            .filter(|(id, _, _)| id == sequence_id)
            .map(|(_, n, _)| *n)
            .collect()
    }

    pub fn faults(&self) -> Vec<RmFault> {
        self.faults.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApplicationListener for RecordingListener {
    async fn on_sequence_message(&self, sequence_id: &str, message_number: u64, payload: Bytes) {
        self.messages.lock().unwrap()
            .push((sequence_id.to_string(), message_number, payload));
    }

    async fn on_sequence_fault(&self, fault: &RmFault) {
        self.faults.lock().unwrap()
            .push(fault.clone());
    }

    async fn on_delivery_failure(&self, failure: DeliveryFailure) {
        self.failures.lock().unwrap()
            .push(failure);
    }
}
