//! Command-line front end for RangeViT.

pub mod config;
pub mod logging;
pub mod runtime;
