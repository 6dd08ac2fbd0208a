//! Scalar types

/// Floating-point type used for every tensor element.
pub type Real = f32;
