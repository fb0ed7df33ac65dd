//! FFmpeg subprocess codec layer: probing, raw RGB decode, H.264 encode.

pub mod decode;
pub mod encode;
pub mod probe;

pub use decode::{read_image, FrameStream, VideoReader};
pub use encode::{EncoderConfig, VideoEncoder};
pub use probe::{probe_video, VideoInfo};
