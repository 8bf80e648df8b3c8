//! Key/value cache carried across decoding steps.
//!
//! A layer keeps exactly one [`LayerPast`] and replaces it wholesale on every
//! forward call.

pub mod api;

pub use api::LayerPast;

#[cfg(test)]
mod tests;
