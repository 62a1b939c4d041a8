//! Shared test utilities for rangevit-core.
//!
//! Tiny configurations and synthetic point batches that keep CPU tests fast.

mod tiny_config;

pub use tiny_config::{random_point_batch, tiny_resolved_config, tiny_vit_config};
