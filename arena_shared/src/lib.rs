//! `arena_shared`
//!
//! Shared libraries used by the gateway, the zones, and the headless client.
//!
//! Design goals:
//! - Bit-exact, versionable wire codecs with no reflection.
//! - Clear separation of concerns (ids, packet, frame, reliable, auth).
//! - Traits for abstraction and dependency injection.
//! - No `unsafe`.

pub mod config;
pub mod cookie;
pub mod frame;
pub mod ids;
pub mod interest;
pub mod limiter;
pub mod messages;
pub mod metrics;
pub mod packet;
pub mod reliable;
pub mod replicate;
pub mod token;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::ids::*;
    pub use crate::interest::*;
    pub use crate::messages::*;
    pub use crate::packet::*;
    pub use crate::replicate::*;
}
