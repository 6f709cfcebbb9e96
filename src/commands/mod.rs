//! Async command surface over the DFU engine.

pub mod dfu;
pub mod firmware;
