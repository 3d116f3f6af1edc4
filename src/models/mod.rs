//! Filter bank configuration and ready-made motion models

pub mod config;
pub mod presets;

pub use config::{FilterSpec, FilterType, ImmSpec};
