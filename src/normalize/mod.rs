//! Identity and field normalization shared by every layer.

pub mod fields;
pub mod key;

pub use key::{derived_synthetic_key, is_synthetic, normalize, RawIdentifier};
