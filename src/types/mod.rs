//! Core types: expressions, bindings, symbolic matrices and state-space maps

pub mod adapter;
pub mod binding;
pub mod expression;
pub mod linalg;
pub mod phase;
pub mod symbolic;
