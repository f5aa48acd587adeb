pub mod cache;
pub mod engine;
pub mod monitor;
pub mod pipeline;
pub mod playback;
pub mod remote;
pub mod resolver;
pub mod session;
