//! Real-time chat relay over TCP.
//!
//! Participants open one persistent stream each and send
//! `{"sender", "message"}` JSON lines; the relay forwards every message to
//! every other connected participant.
//!
//! - [`message`] defines the wire type and line framing.
//! - [`handle`] is the outbound side of a stream: a bounded queue drained by
//!   one writer task per connection.
//! - [`registry`] maps participant identities to their handles.
//! - [`dispatcher`] fans a message out to everyone but its sender.
//! - [`session`] runs the receive loop for one connection.
//! - [`relay`] accepts connections and wires sessions to the shared registry.
//! - [`client`] is the participant side, plus a line-based terminal client.
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod dispatcher;
pub mod handle;
pub mod message;
pub mod registry;
pub mod relay;
pub mod session;
