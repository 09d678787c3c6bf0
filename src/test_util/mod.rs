//! Test doubles for the engine's collaborators. They are part of the regular code (not
//!  `#[cfg(test)]`) so applications and integration tests can use them as well.

use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::NoSecurity;
use crate::config::RmConfig;
use crate::context::RmContext;
use crate::store::StorageManager;
use crate::test_util::listener::RecordingListener;
use crate::test_util::transport::TrackingTransport;

pub mod listener;
pub mod transport;


/// the default configuration with faster worker ticks
pub fn test_config() -> RmConfig {
    let mut config = RmConfig::new();
    config.scheduler_tick = Duration::from_millis(10);
    config.invoker_tick = Duration::from_millis(10);
    config
}

pub fn test_context(transport: Arc<TrackingTransport>) -> RmContext {
    test_context_with_listener(transport, Arc::new(RecordingListener::default()))
}

pub fn test_context_with_listener(transport: Arc<TrackingTransport>, listener: Arc<RecordingListener>) -> RmContext {
    RmContext::new(
        Arc::new(test_config()),
        Arc::new(StorageManager::in_memory()),
        transport,
        Arc::new(NoSecurity {}),
        listener,
    )
}

