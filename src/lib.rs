//! Managed Slack Real-Time Messaging client.
//!
//! The crate is organized by transport surface:
//! - `web_api`: HTTP session negotiation (`rtm.start` / `rtm.connect`).
//! - `rtm`: realtime connection manager, wire frames, and typed events.
//! - `retry`: shared retry and timeout utilities.

/// Retry and timeout helpers used across the crate.
pub mod retry;
/// Realtime connection manager, protocol types, and event routing.
pub mod rtm;
/// Web API negotiation client and session types.
pub mod web_api;
