//! Testing utilities and mock implementations
//!
//! Mocks for the adapter and health seams, so dispatch logic can be tested
//! without live backends.

pub mod mocks;

pub use mocks::*;
