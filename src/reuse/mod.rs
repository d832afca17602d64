//! Sharing one UDP socket between a listener and outbound dials.
//!
//! A [`ReuseSocket`] is one bound socket handed to the engine, plus the bookkeeping of which
//! sessions run over it. The [`ReuseManager`] keeps them by local address, hands out the
//! listening socket for dials so that peers see a stable source port, and closes sockets that
//! have been idle for too long.

pub use manager::ReuseManager;
pub use socket::{Association, ReuseSocket};

mod manager;
mod socket;
