use std::time::Duration;

use reqwest::Url;

use crate::error::{ClientError, Result};

const DEFAULT_HEARTBEAT_SECS: u64 = 25;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Where the hosted backend lives and how to talk to it.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Project base URL, always with a trailing slash so joins keep the path.
    pub project_url: Url,
    /// Public API key sent with every request.
    pub anon_key: String,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(project_url: &str, anon_key: impl Into<String>) -> Result<Self> {
        let mut url = project_url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        let project_url = Url::parse(&url)
            .map_err(|e| ClientError::Config(format!("invalid project url '{}': {}", project_url, e)))?;

        if !matches!(project_url.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "project url must be http or https, got '{}'",
                project_url.scheme()
            )));
        }

        Ok(Self {
            project_url,
            anon_key: anon_key.into(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    /// Reads `HUDDLE_URL`, `HUDDLE_ANON_KEY`, `HUDDLE_HEARTBEAT_SECS` and
    /// `HUDDLE_REQUEST_TIMEOUT_SECS` from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("HUDDLE_URL").ok_or_else(|| ClientError::Config("HUDDLE_URL is not set".into()))?;
        let anon_key =
            lookup("HUDDLE_ANON_KEY").ok_or_else(|| ClientError::Config("HUDDLE_ANON_KEY is not set".into()))?;

        let mut config = Self::new(&url, anon_key)?;
        if let Some(secs) = lookup("HUDDLE_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(parse_secs("HUDDLE_HEARTBEAT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("HUDDLE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(parse_secs("HUDDLE_REQUEST_TIMEOUT_SECS", &secs)?);
        }
        Ok(config)
    }

    /// PostgREST endpoint for a table.
    pub fn rest_url(&self, table: &str) -> Url {
        self.join(&format!("rest/v1/{}", table))
    }

    pub fn auth_url(&self, path: &str) -> Url {
        self.join(&format!("auth/v1/{}", path))
    }

    /// WebSocket endpoint of the change feed.
    pub fn realtime_url(&self) -> Result<Url> {
        let mut url = self.join("realtime/v1/websocket");
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot derive websocket url from {}", self.project_url)))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    fn join(&self, path: &str) -> Url {
        // The base always ends with '/', and `path` is relative, so this cannot fail.
        self.project_url
            .join(path)
            .unwrap_or_else(|_| self.project_url.clone())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ClientError::Config(format!("{} must be a positive integer, got '{}'", key, value))),
        Ok(secs) => Ok(secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn builds_endpoint_urls() {
        let config = ClientConfig::new("https://abc.example.co", "anon").unwrap();
        assert_eq!(config.rest_url("messages").as_str(), "https://abc.example.co/rest/v1/messages");
        assert_eq!(config.auth_url("user").as_str(), "https://abc.example.co/auth/v1/user");
        assert_eq!(
            config.realtime_url().unwrap().as_str(),
            "wss://abc.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn keeps_path_prefix() {
        let config = ClientConfig::new("http://localhost:54321/project", "k").unwrap();
        assert_eq!(config.rest_url("channels").as_str(), "http://localhost:54321/project/rest/v1/channels");
        assert!(config.realtime_url().unwrap().as_str().starts_with("ws://localhost:54321/project/"));
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(matches!(ClientConfig::new("ftp://host", "k"), Err(ClientError::Config(_))));
    }

    #[test]
    fn reads_lookup_with_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("HUDDLE_URL", "https://abc.example.co"),
            ("HUDDLE_ANON_KEY", "anon"),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(25));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_intervals() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("HUDDLE_URL", "https://abc.example.co"),
            ("HUDDLE_ANON_KEY", "anon"),
            ("HUDDLE_HEARTBEAT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_key_is_config_error() {
        let err = ClientConfig::from_lookup(lookup(&[("HUDDLE_URL", "https://abc.example.co")])).unwrap_err();
        assert!(err.to_string().contains("HUDDLE_ANON_KEY"));
    }

    #[test]
    fn zero_heartbeat_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("HUDDLE_URL", "https://abc.example.co"),
            ("HUDDLE_ANON_KEY", "anon"),
            ("HUDDLE_HEARTBEAT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }
}
