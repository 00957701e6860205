//! Parameterized layers composed from the functional graph builders.
//!
//! A layer owns a [`crate::params::ParamScope`] and declares its parameters the first time it is
//! applied, deriving their shapes from the inputs it sees. Applying a layer again reuses the
//! same parameter nodes.

pub mod layers;

pub use layers::*;
