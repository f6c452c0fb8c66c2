pub mod client;
pub mod endpoints;
pub mod sse;

pub use client::CloudCodeClient;
pub use sse::{decode_sse_stream, StreamEvent};
