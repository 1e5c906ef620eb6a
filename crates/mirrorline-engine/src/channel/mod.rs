//! Message-channel pipeline: filters and the resumable parse driver.

pub mod driver;
pub mod filter;

pub use driver::{parse_channel, ChannelOptions};
