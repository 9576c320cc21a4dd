//! # Relay
//!
//! A WebSocket relay between the two host-side helpers.
//!
//! Clients connect, send `register{client}` and from then on every `ae_data`
//! frame reaches the registered `resolve` client and every `resolve_data`
//! frame reaches `ae`, byte for byte. The hub also answers `ping`, runs
//! producer commands through [`HostCommands`] and serves `GET /health` and
//! `GET /status` on the same port.

pub mod client;
pub mod envelope;
pub mod hub;
pub mod scripts;

pub use client::RelayClient;
pub use envelope::{classify, Envelope, Rejection};
pub use hub::RelayHub;
pub use scripts::{HostCommands, ScriptRunner};
