//! Core crate for the gradia color-grading pipeline.

pub mod batch;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod runtime;
pub mod sampler;
pub mod server;
pub mod types;
pub mod video;
pub mod worker;
