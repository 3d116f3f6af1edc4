//! State estimation filters
//!
//! - [`kalman::Filter`]: linear or extended Kalman filter for one motion model
//! - [`imm::InteractingMultipleModel`]: bank of filters blended by mode
//!   probabilities

pub mod imm;
pub mod kalman;
