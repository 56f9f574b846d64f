//! HTTP client for a running labvm server.

use anyhow::{bail, Context, Result};
use reqwest::Method;
use serde_json::Value;

pub struct ApiClient {
    base_url: String,
    user_id: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Calls go out as `user_id` with the admin role.
    pub fn new(base_url: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.call(Method::GET, path).await
    }

    pub async fn post(&self, path: &str) -> Result<Value> {
        self.call(Method::POST, path).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.call(Method::DELETE, path).await
    }

    async fn call(&self, method: Method, path: &str) -> Result<Value> {
        let resp = self
            .http
            .request(method, self.url(path))
            .header("x-user-id", &self.user_id)
            .header("x-user-role", "admin")
            .send()
            .await
            .with_context(|| format!("labvm is not reachable at {}", self.base_url))?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("no details");
            bail!("{path} failed with {status}: {message}");
        }
        Ok(body)
    }
}

/// Base URL for a server bound to `bind:port`, as seen from this host.
pub fn local_base_url(bind: &str, port: u16) -> String {
    let host = match bind {
        "0.0.0.0" | "" => "127.0.0.1",
        "::" => "[::1]",
        other if other.contains(':') => return format!("http://[{other}]:{port}"),
        other => other,
    };
    format!("http://{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_binds_resolve_to_loopback() {
        assert_eq!(local_base_url("0.0.0.0", 8088), "http://127.0.0.1:8088");
        assert_eq!(local_base_url("::", 8088), "http://[::1]:8088");
        assert_eq!(local_base_url("10.0.0.5", 9000), "http://10.0.0.5:9000");
        assert_eq!(local_base_url("fe80::1", 9000), "http://[fe80::1]:9000");
    }

    #[test]
    fn trailing_slash_is_dropped() {
        let client = ApiClient::new("http://127.0.0.1:8088/", "ops");
        assert_eq!(client.url("/api/health"), "http://127.0.0.1:8088/api/health");
    }

    #[tokio::test]
    async fn unreachable_server_is_reported() {
        let client = ApiClient::new("http://127.0.0.1:1", "ops");
        let err = client.get("/api/health").await.unwrap_err();
        assert!(err.to_string().contains("not reachable"));
    }
}
