//! Client to the secrets daemon.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::Connection;
use crate::config::Settings;
use crate::error::Result;

/// A client to the secrets service. Secrets are key/value pairs owned by
/// a repository, a user or an organization.
pub struct SecretsClient {
    conn: Connection,
    token: String,
}

impl SecretsClient {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let conn = Connection::connect(&settings.secrets_host, settings.secrets_port).await?;
        Ok(Self {
            conn,
            token: settings.secrets_token.clone(),
        })
    }

    /// Adds a secret, or updates it if the owner already has the key.
    pub async fn add_or_update_secret(
        &mut self,
        owner: &str,
        key: &str,
        value: &str,
    ) -> Result<Value> {
        let body = json!({"owner": owner, "key": key, "value": value});
        let token = self.token.clone();
        self.conn
            .request2server("add-or-update-secret", body, &token)
            .await
    }

    pub async fn remove_secret(&mut self, owner: &str, key: &str) -> Result<Value> {
        let body = json!({"owner": owner, "key": key});
        let token = self.token.clone();
        self.conn
            .request2server("remove-secret", body, &token)
            .await
    }

    /// The secrets of a list of owners, merged into one map.
    pub async fn get_secrets(&mut self, owners: &[String]) -> Result<HashMap<String, String>> {
        let body = json!({"owners": owners});
        let token = self.token.clone();
        let response = self.conn.request2server("get-secrets", body, &token).await?;

        let secrets = response
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok(secrets)
    }

    /// Removes every secret of an owner.
    pub async fn remove_all(&mut self, owner: &str) -> Result<Value> {
        let body = json!({"owner": owner});
        let token = self.token.clone();
        self.conn.request2server("remove-all", body, &token).await
    }
}
