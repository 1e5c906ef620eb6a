//! `reqwest` transport for the CMS REST API.

use std::time::Duration;

use async_trait::async_trait;
use mirrorline_types::error::codes;
use mirrorline_types::SyncError;

use crate::clients::cms::{CmsHttpClient, HttpResponse};
use crate::resolve::Credentials;

/// REST path appended to a site's base URL.
pub const API_ROOT: &str = "/wp-json/wp/v2";

/// Basic-auth GET client rooted at `<base_url>/wp-json/wp/v2`.
#[derive(Debug)]
pub struct ReqwestCmsClient {
    http: reqwest::Client,
    api_root: String,
    credentials: Option<Credentials>,
}

impl ReqwestCmsClient {
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mirrorline/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::config("HTTP_CLIENT", format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_root: api_root(base_url),
            credentials,
        })
    }

    #[must_use]
    pub fn api_root(&self) -> &str {
        &self.api_root
    }
}

/// `<base_url>/wp-json/wp/v2`, tolerating a trailing slash on the base.
#[must_use]
pub fn api_root(base_url: &str) -> String {
    format!("{}{API_ROOT}", base_url.trim().trim_end_matches('/'))
}

#[async_trait]
impl CmsHttpClient for ReqwestCmsClient {
    async fn get(&self, path: &str, params: &[(String, String)]) -> Result<HttpResponse, SyncError> {
        let url = format!("{}{path}", self.api_root);
        let mut request = self.http.get(&url).query(params);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.user, Some(&creds.password));
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(transport_error)?;
        Ok(HttpResponse::new(status, headers, body))
    }
}

fn transport_error(err: reqwest::Error) -> SyncError {
    let err = err.without_url();
    if err.is_timeout() {
        SyncError::timeout(err.to_string())
    } else {
        SyncError::network(if err.is_connect() { "CONNECT" } else { codes::HTTP_STATUS }, err.to_string())
    }
}
