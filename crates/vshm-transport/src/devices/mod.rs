//! Device classes carried over the transport.
//!
//! Only the block class has a complete backend. Net and input provide their config blobs.

pub mod blk;
pub mod input;
pub mod net;
