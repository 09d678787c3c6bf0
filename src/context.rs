use std::sync::Arc;

use tokio::sync::Notify;

use crate::collaborators::{ApplicationListener, SecurityManager, SignedElement, Transport};
use crate::config::RmConfig;
use crate::fault::RmError;
use crate::registry::SequenceRegistry;
use crate::store::StorageManager;
use crate::wsrm::message::{RmMessage, SecurityTokenRef};


/// Everything the engine's components share. There is one context per engine, and it is passed
///  around explicitly - there is no process wide state.
pub struct RmContext {
    pub config: Arc<RmConfig>,
    pub storage: Arc<StorageManager>,
    pub registry: SequenceRegistry,
    pub transport: Arc<dyn Transport>,
    pub security: Arc<dyn SecurityManager>,
    pub listener: Arc<dyn ApplicationListener>,
    /// notified when an invocation task was added, so the invoker need not wait for its tick
    pub invoker_wakeup: Notify,
}

impl RmContext {
    pub fn new(
        config: Arc<RmConfig>,
        storage: Arc<StorageManager>,
        transport: Arc<dyn Transport>,
        security: Arc<dyn SecurityManager>,
        listener: Arc<dyn ApplicationListener>,
    ) -> RmContext {
        RmContext {
            config,
            registry: SequenceRegistry::new(storage.clone()),
            storage,
            transport,
            security,
            listener,
            invoker_wakeup: Notify::new(),
        }
    }

    /// Checks that a message for a sequence bound to a security token was sent by the holder of
    ///  that token. Sequences without a token accept any message.
    ///
    /// NB: This fails closed - a message without a token for a sequence with a token is rejected
    pub fn verify_token(&self, sequence_token: &Option<SecurityTokenRef>, element: SignedElement, message: &RmMessage) -> Result<(), RmError> {
        let Some(token) = sequence_token else {
            return Ok(());
        };

        if message.security_token.as_ref() != Some(token) {
            return Err(RmError::Security(anyhow::anyhow!("message {} is not secured with the sequence's token", message.message_id)));
        }

        self.security.check_proof_of_possession(token, element, message)
            .map_err(RmError::Security)
    }
}
