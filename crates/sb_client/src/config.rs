//! Client configuration: server endpoint + connection identity.

use sb_crypto::dh::SERVER_PUBLIC_KEY;

use crate::error::ClientError;

/// Everything a [`crate::Client`] needs to dial the server for one user.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://…` or `https://…` base URL of the hosting deployment.
    pub base_url: String,
    pub app_id: String,
    pub username: String,
    /// Session id issued at sign-up/sign-in by the hosting application.
    pub session_id: String,
    /// The server's X25519 public key. Defaults to the compiled-in
    /// deployment key; overridable for self-hosted servers and tests.
    pub server_public_key: [u8; 32],
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        username: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            app_id: app_id.into(),
            username: username.into(),
            session_id: session_id.into(),
            server_public_key: SERVER_PUBLIC_KEY,
        }
    }

    pub fn with_server_public_key(mut self, key: [u8; 32]) -> Self {
        self.server_public_key = key;
        self
    }

    /// Derive the WebSocket origin from the base URL:
    /// `https://host` → `wss://host/api?appId=…&sessionId=…`.
    pub fn ws_url(&self) -> Result<String, ClientError> {
        let origin = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ClientError::InvalidEndpoint(format!(
                "expected http:// or https:// base URL, got {:?}",
                self.base_url
            )));
        };
        let origin = origin.trim_end_matches('/');
        Ok(format!(
            "{origin}/api?appId={}&sessionId={}",
            self.app_id, self.session_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_becomes_wss() {
        let cfg = ClientConfig::new("https://api.example.com", "app-1", "alice", "sess-1");
        assert_eq!(
            cfg.ws_url().unwrap(),
            "wss://api.example.com/api?appId=app-1&sessionId=sess-1"
        );
    }

    #[test]
    fn http_becomes_ws_and_trailing_slash_is_dropped() {
        let cfg = ClientConfig::new("http://localhost:8080/", "app-1", "alice", "s");
        assert_eq!(cfg.ws_url().unwrap(), "ws://localhost:8080/api?appId=app-1&sessionId=s");
    }

    #[test]
    fn other_schemes_are_rejected() {
        let cfg = ClientConfig::new("ftp://example.com", "a", "u", "s");
        assert!(matches!(cfg.ws_url(), Err(ClientError::InvalidEndpoint(_))));
    }
}
