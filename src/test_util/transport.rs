use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::collaborators::Transport;
use crate::wsrm::endpoint::EndpointAddr;
use crate::wsrm::message::{RmMessage, RmMessageKind};


/// A [Transport] that records everything it is asked to send instead of sending it
#[derive(Debug, Default)]
pub struct TrackingTransport {
    sent: Mutex<Vec<(EndpointAddr, RmMessage)>>,
    delivered: Mutex<Vec<RmMessage>>,
    failing: AtomicBool,
}

impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        Default::default()
    }

    /// while failing, every send returns an error (the message is still recorded)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    pub fn sent(&self) -> Vec<(EndpointAddr, RmMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<(EndpointAddr, RmMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn sent_of_kind(&self, kind: RmMessageKind) -> Vec<RmMessage> {
        self.sent.lock().unwrap()
            .iter()
            .filter(|(_, msg)| msg.kind() == kind)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn delivered(&self) -> Vec<RmMessage> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn assert_no_remaining_messages(&self) {
        let sent = self.sent.lock().unwrap();
        assert!(sent.is_empty(), "unexpected messages: {:?}", sent);
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn send(&self, to: &EndpointAddr, message: RmMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap()
            .push((to.clone(), message));
        if self.failing.load(Ordering::Acquire) {
            return Err(anyhow::anyhow!("simulated send failure"));
        }
        Ok(())
    }

    async fn deliver_inbound(&self, message: RmMessage) {
        self.delivered.lock().unwrap()
            .push(message);
    }
}
