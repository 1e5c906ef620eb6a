//! Semantic validation for parsed config values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::{MirrorConfig, StorageBackendKind};

/// Validate a parsed config, reporting every problem at once.
///
/// # Errors
///
/// Returns an error listing all validation failures.
pub fn validate_config(config: &MirrorConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.storage.backend == StorageBackendKind::Postgres
        && config
            .storage
            .connection
            .as_deref()
            .map_or(true, |c| c.trim().is_empty())
    {
        errors.push("storage.connection is required for the postgres backend".to_string());
    }

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path must not be empty".to_string());
    }

    if config.retry.call_timeout_secs == 0 {
        errors.push("retry.call_timeout_secs must be > 0".to_string());
    }
    if config.retry.max_delay_secs == 0 {
        errors.push("retry.max_delay_secs must be > 0".to_string());
    }

    if !(1..=100).contains(&config.cms.per_page) {
        errors.push(format!(
            "cms.per_page must be between 1 and 100, got {}",
            config.cms.per_page
        ));
    }
    if config.cms.credentials_env_prefix.trim().is_empty() {
        errors.push("cms.credentials_env_prefix must not be empty".to_string());
    }

    let mut seen = HashSet::new();
    for (i, site) in config.cms.sites.iter().enumerate() {
        if site.site_id.trim().is_empty() {
            errors.push(format!("cms.sites[{i}] has an empty site_id"));
        } else if !seen.insert(site.site_id.as_str()) {
            errors.push(format!("cms.sites[{i}]: duplicate site_id '{}'", site.site_id));
        }
        let url = site.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "cms.sites[{i}]: base_url '{}' must start with http:// or https://",
                site.base_url
            ));
        }
    }

    if config.channel.page_size == 0 {
        errors.push("channel.page_size must be at least 1".to_string());
    }
    if !config.channel.requests_per_second.is_finite() || config.channel.requests_per_second < 0.0 {
        errors.push("channel.requests_per_second must be >= 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Config validation failed:\n  - {}", errors.join("\n  - "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_config_str;

    fn valid_yaml() -> &'static str {
        r"
storage:
  backend: sqlite
  path: data/test.db
cms:
  sites:
    - site_id: blog
      base_url: https://blog.example.com
    - site_id: shop
      base_url: http://shop.example.com
"
    }

    #[test]
    fn test_valid_config_passes() {
        let config = parse_config_str(valid_yaml()).unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_config_passes() {
        let config = parse_config_str("{}").unwrap();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_postgres_without_connection_fails() {
        let config = parse_config_str("storage:\n  backend: postgres").unwrap();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("storage.connection"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let yaml = r"
cms:
  per_page: 500
  sites:
    - site_id: blog
      base_url: ftp://blog.example.com
    - site_id: blog
      base_url: https://other.example.com
    - site_id: ''
      base_url: https://x.example.com
";
        let config = parse_config_str(yaml).unwrap();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("per_page"), "{err}");
        assert!(err.contains("ftp://"), "{err}");
        assert!(err.contains("duplicate site_id 'blog'"), "{err}");
        assert!(err.contains("empty site_id"), "{err}");
    }

    #[test]
    fn test_zero_timeout_fails() {
        let config = parse_config_str("retry:\n  call_timeout_secs: 0").unwrap();
        assert!(validate_config(&config).is_err());
    }
}
