//! Adapters to the outside world.

pub mod transport;
