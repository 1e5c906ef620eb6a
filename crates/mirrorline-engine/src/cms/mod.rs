//! CMS entity pipeline: REST fetch, mapping, and per-site sync.

pub mod driver;
pub mod http;
pub mod mapper;

pub use driver::CmsPipeline;
