//! Suspension primitives.

mod baton;
mod cooperator;

pub use baton::{Baton, BatonResult, Exchange};
pub use cooperator::{Cooperator, Yield};
