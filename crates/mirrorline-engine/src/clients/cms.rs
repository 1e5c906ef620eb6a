//! CMS HTTP collaborator interface.

use std::collections::HashMap;

use async_trait::async_trait;
use mirrorline_types::SyncError;

/// Raw HTTP response. Header names are stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new<I, K, V>(status: u16, headers: I, body: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
            body: body.into(),
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Issues authenticated GET requests against one site's REST root.
///
/// Transport failures come back as network-kind [`SyncError`]s; HTTP status
/// classification happens in the caller.
#[async_trait]
pub trait CmsHttpClient: Send + Sync {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<HttpResponse, SyncError>;
}
