//! Realtime messaging modules.
//!
//! - `manager`: connection lifecycle, send queue, liveness, and reconnects.
//! - `events`: classification of inbound frames into typed events.
//! - `proto`: frames exchanged with the realtime service.
//! - `transport`: dialer seam and the websocket implementation.
//! - `state`: lock-guarded connection state shared by the manager's loops.
//! - `id`: correlation id generator.

/// Error types shared by the manager and its events.
pub mod error;
/// Typed events and the frame classifier.
pub mod events;
/// Correlation id generation.
pub mod id;
/// Connection manager and caller-facing handles.
pub mod manager;
/// Realtime protocol frames.
pub mod proto;
/// Manager lifecycle state.
pub mod state;
/// Streaming transport abstraction.
pub mod transport;
