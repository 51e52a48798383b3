//! `arena_client`
//!
//! Headless client pieces: the reliable UDP peer and the cookie handshake
//! driver. The binary wraps them in a line-oriented console REPL; the
//! integration tests drive them directly. No render loop lives here.

pub mod peer;
