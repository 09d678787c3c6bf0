//! A WS-ReliableMessaging sequence engine (WS-RM 1.0 and 1.1, with WS-MakeConnection polling).
//!
//! [engine::RmEngine] is the entry point. Outbound application messages are numbered within
//!  sequences and re-sent until acknowledged; inbound messages are acknowledged, de-duplicated
//!  and handed to the application, optionally in message number order. The engine does not
//!  touch the network or XML itself: that is the [collaborators::Transport]'s job.

pub mod ack;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod fault;
pub mod invoker;
pub mod lifecycle;
pub mod outbound;
pub mod polling;
pub mod processors;
pub mod ranges;
pub mod registry;
pub mod scheduler;
pub mod sequence_processor;
pub mod store;
pub mod test_util;
pub mod util;
pub mod wsrm;
