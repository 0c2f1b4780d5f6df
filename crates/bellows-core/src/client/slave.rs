//! Client to the slave build daemon.

use std::time::Duration;

use serde_json::{json, Value};

use super::Connection;
use crate::config::Settings;
use crate::error::{BellowsError, Result};

/// A client to one slave daemon.
pub struct SlaveClient {
    conn: Connection,
    token: String,
    config_type: String,
    config_filename: String,
}

impl SlaveClient {
    pub async fn connect(
        host: &str,
        port: u16,
        token: &str,
        settings: &Settings,
    ) -> Result<Self> {
        let conn = Connection::connect(host, port).await?;
        Ok(Self {
            conn,
            token: token.to_string(),
            config_type: settings.build_config_type.clone(),
            config_filename: settings.build_config_filename.clone(),
        })
    }

    /// Asks whether the server is up. An empty response means we reached
    /// a tls-enabled slave in plain mode, which is a configuration error,
    /// not a down server.
    pub async fn healthcheck(&mut self) -> Result<bool> {
        self.conn.send(&json!({"action": "healthcheck"})).await?;
        let raw = self.conn.recv_raw().await?;
        if raw.is_empty() {
            return Err(BellowsError::BadConnection(
                "Bad connection. Check the slave ssl settings.".to_string(),
            ));
        }
        Ok(true)
    }

    /// Asks the slave for the builders available for a repository at
    /// `named_tree` on `branch`.
    pub async fn list_builders(
        &mut self,
        repo_url: &str,
        vcs_type: &str,
        branch: &str,
        named_tree: &str,
    ) -> Result<Vec<String>> {
        let request = json!({
            "action": "list_builders",
            "token": self.token,
            "body": {
                "repo_url": repo_url,
                "vcs_type": vcs_type,
                "branch": branch,
                "named_tree": named_tree,
                "config_type": self.config_type,
                "config_filename": self.config_filename,
            }
        });
        self.conn.send(&request).await?;
        let response = self
            .conn
            .recv()
            .await?
            .ok_or_else(|| BellowsError::Client("empty response to list_builders".to_string()))?;

        let builders = response["body"]["builders"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(builders)
    }

    /// Requests a build, consuming this client into the response stream.
    ///
    /// `unresponsive_timeout` bounds the request write and each stream
    /// read; a stalled slave surfaces as a timeout error.
    pub async fn build(
        mut self,
        mut body: Value,
        unresponsive_timeout: Option<Duration>,
    ) -> Result<BuildStream> {
        body["config_type"] = json!(self.config_type);
        body["config_filename"] = json!(self.config_filename);
        let request = json!({
            "action": "build",
            "token": self.token,
            "body": body,
        });
        self.conn
            .send_with_timeout(&request, unresponsive_timeout)
            .await?;

        Ok(BuildStream {
            conn: self.conn,
            timeout: unresponsive_timeout,
        })
    }

    /// Asks the slave to cancel a build. The terminal status flows back
    /// through that build's stream, not through this response.
    pub async fn cancel_build(&mut self, build_uuid: &str) -> Result<Value> {
        let request = json!({
            "action": "cancel_build",
            "token": self.token,
            "body": {"build_uuid": build_uuid},
        });
        self.conn.send(&request).await?;
        let response = self
            .conn
            .recv()
            .await?
            .ok_or_else(|| BellowsError::Client("empty response to cancel_build".to_string()))?;
        Ok(response)
    }
}

/// The streamed frames of one running build.
pub struct BuildStream {
    conn: Connection,
    timeout: Option<Duration>,
}

impl BuildStream {
    /// The next info frame, or `None` at end-of-stream (empty frame or a
    /// frame without a body).
    pub async fn next_info(&mut self) -> Result<Option<Value>> {
        let response = match self.conn.recv_with_timeout(self.timeout).await? {
            Some(response) => response,
            None => return Ok(None),
        };

        match response.get("body") {
            Some(body) if !body.is_null() => Ok(Some(body.clone())),
            _ => Ok(None),
        }
    }
}
