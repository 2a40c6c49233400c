//! An AllJoyn-flavored message-bus router: a D-Bus-compatible broker with
//! multi-party, cross-daemon sessions, federated name propagation and
//! discovery.

pub mod attachment;
pub mod auth;
pub mod bus;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod guid;
pub mod listen;
pub mod match_rules;
pub mod name_service;
pub mod name_table;
pub mod objects;
pub mod propagation;
pub mod router;
pub mod sessions;
pub mod tracing_subscriber;
