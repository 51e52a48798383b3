//! `arena_gateway`
//!
//! The client-facing edge: owns the UDP socket and one framed TCP link per
//! zone. Holds no simulation state, only per-session network state — the
//! reliable channel windows, routing target, and in-flight transfer
//! records for the two-phase handoff.

pub mod gateway;
pub mod link;
pub mod session;
