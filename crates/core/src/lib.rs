//! RangeViT: a Vision Transformer for semantic segmentation of LiDAR range
//! images, with an optional KPConv head for per-point predictions.

pub mod config;
pub mod error;
pub mod layers;
pub mod loader;
pub mod models;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{RangeViTConfig, ResolvedConfig};
pub use error::{RangeViTError, Result};
pub use models::{PointBatch, RangeViT, RangeViTNet};
