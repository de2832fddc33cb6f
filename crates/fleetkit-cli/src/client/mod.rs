//! Control-plane client implementations.

pub mod vendor;
