//! ClusterSync - camera and buffer-swap synchronization for render clusters
//!
//! One controller drives several renderers so that a shared virtual camera
//! stays in lock-step across tiled displays and buffer swaps happen together.

pub mod config;
pub mod network;
pub mod protocol;
