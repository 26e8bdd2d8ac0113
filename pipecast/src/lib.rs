pub mod config;
pub mod media;
pub mod monitor;
pub mod pacer;
pub mod producer;
pub mod relay;
pub mod rtc;
pub mod shutdown;
pub mod signaling;
pub mod utils;
