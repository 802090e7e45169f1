#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # tstream-hub
//! tstream-hub is the server side of live terminal broadcasting. A streamer sends its terminal
//! output to a [`room::Room`], and viewers connected to the same room receive it together with a
//! shared chat. Audio and video are forwarded between room members by a small WebRTC SFU in
//! [`sfu`].
//!
//! This crate does not listen on any socket. Hand every accepted connection to
//! [`hub::Hub::accept`] wrapped in a [`transport::Transport`].
//! `demos/terminal_relay.rs` is an example relay server over WebSocket.

/// Role-tagged duplex connection with outbound and inbound queues.
pub mod client;
/// Configuration for [`hub::Hub`], [`room::Room`] and [`sfu::Sfu`].
pub mod config;
pub mod error;
/// Hub is a registry of rooms. It also performs the connection handshake.
pub mod hub;
/// Wire envelope and its payloads.
pub mod message;
pub mod recorder;
mod replay_buffer;
/// Room is a session hub that wraps one streamer and its clients together.
pub mod room;
/// WebRTC SFU that forwards published tracks between room members.
pub mod sfu;
pub mod store;
pub mod transport;
