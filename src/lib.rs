//! WebSocket relay that turns controller commands into device control tokens.
//!
//! Any number of clients hold persistent WebSocket connections to the relay.
//! Each inbound text frame is looked up in a fixed command table and, when it
//! maps to a token, that token is broadcast to every connected peer --
//! including the one that sent the command. Unmapped commands are dropped.
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for serve and client modes.
//! - [`relay`] accepts WebSocket connections, keeps the registry of open
//!   connections, and fans mapped tokens out to all of them.
//! - [`command`] is the static command-to-token table.
//! - [`client`] connects to a relay, multiplexing stdin commands and
//!   broadcast tokens for a terminal user.
//!
//! Integration tests use this crate directly to exercise the registry
//! life cycle and the broadcast path over real sockets.

pub mod cli;
pub mod client;
pub mod command;
pub mod relay;
