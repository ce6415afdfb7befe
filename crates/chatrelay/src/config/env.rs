//! Environment variable overrides
//!
//! Applied after the config file is read and before CLI flags, so a `.env`
//! file or the process environment can supply deployment credentials without
//! writing them to disk in `config.toml`.

use super::Config;
use crate::error::{RelayError, Result};

const ENDPOINT_VAR: &str = "AZURE_OPENAI_ENDPOINT";
const DEPLOYMENT_VAR: &str = "AZURE_OPENAI_DEPLOYMENT";
const API_KEY_VAR: &str = "AZURE_OPENAI_API_KEY";
const API_VERSION_VAR: &str = "AZURE_OPENAI_API_VERSION";
const TIMEOUT_VAR: &str = "AZURE_TIMEOUT";

/// Checked in order; the first non-empty value becomes the egress proxy
const PROXY_VARS: &[&str] = &["CNTLM_PROXY", "HTTPS_PROXY", "HTTP_PROXY"];

/// Overlay environment values onto `config`.
///
/// `lookup` is usually `|key| std::env::var(key).ok()`; tests pass a map.
/// Empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(endpoint) = get(ENDPOINT_VAR) {
        config.upstream.endpoint = endpoint;
    }
    if let Some(deployment) = get(DEPLOYMENT_VAR) {
        config.upstream.deployment = deployment;
    }
    if let Some(api_key) = get(API_KEY_VAR) {
        config.upstream.api_key = api_key;
    }
    if let Some(api_version) = get(API_VERSION_VAR) {
        config.upstream.api_version = api_version;
    }
    if let Some(timeout) = get(TIMEOUT_VAR) {
        config.upstream.timeout_secs = timeout.trim().parse().map_err(|e| {
            RelayError::Config(format!("{TIMEOUT_VAR} must be a number of seconds: {e}"))
        })?;
    }
    if let Some(proxy) = PROXY_VARS.iter().find_map(|key| get(*key)) {
        config.upstream.proxy_url = Some(proxy);
    }

    Ok(())
}
