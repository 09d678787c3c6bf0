//! The WS-ReliableMessaging wire model: profiles, elements and the message envelope.

pub mod elements;
pub mod endpoint;
pub mod message;
pub mod spec_version;
