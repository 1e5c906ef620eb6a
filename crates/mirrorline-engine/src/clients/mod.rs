//! Remote collaborator interfaces and their concrete adapters.
//!
//! The drivers only talk to [`MessageChannelClient`] and [`CmsHttpClient`];
//! tests substitute in-memory fakes.

pub mod channel;
pub mod cms;
pub mod feed;
pub mod http;

pub use channel::{MessageChannelClient, RemoteMedia, RemoteMessage};
pub use cms::{CmsHttpClient, HttpResponse};
pub use feed::FeedChannelClient;
pub use http::ReqwestCmsClient;
