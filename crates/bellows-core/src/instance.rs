//! Cloud instance lifecycle for on-demand slaves.
//!
//! The provider backend is an external collaborator; the core only needs
//! start/stop/is_running/get_ip. The default ec2 implementation talks to
//! the fabric's cloud agent over HTTP.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{BellowsError, Result};

/// Supported instance backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    Ec2,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Ec2 => "ec2",
        }
    }
}

impl std::str::FromStr for InstanceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ec2" => Ok(InstanceType::Ec2),
            _ => Err(format!("Unknown instance type: {}", s)),
        }
    }
}

/// Handle to one cloud instance backing an on-demand slave.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> Result<bool>;

    /// The instance's current IP address.
    async fn get_ip(&self) -> Result<String>;
}

/// Builds an instance handle from a slave's instance_type and
/// instance_confs.
pub fn create_instance(
    instance_type: InstanceType,
    confs: &Value,
) -> Result<Box<dyn InstanceProvider>> {
    match instance_type {
        InstanceType::Ec2 => Ok(Box::new(Ec2Instance::from_confs(confs)?)),
    }
}

/// EC2 instance reached through the cloud agent.
pub struct Ec2Instance {
    client: reqwest::Client,
    instance_id: String,
    region: String,
    agent_url: String,
}

impl Ec2Instance {
    pub fn from_confs(confs: &Value) -> Result<Self> {
        let instance_id = confs
            .get("instance_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BellowsError::Instance("instance_confs without instance_id".to_string())
            })?
            .to_string();
        let region = confs
            .get("region")
            .and_then(Value::as_str)
            .ok_or_else(|| BellowsError::Instance("instance_confs without region".to_string()))?
            .to_string();
        let agent_url = confs
            .get("agent_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| std::env::var("CLOUD_AGENT_URL").ok())
            .unwrap_or_else(|| "http://localhost:9605".to_string());

        Ok(Self {
            client: reqwest::Client::new(),
            instance_id,
            region,
            agent_url,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/instances/{}{}?region={}",
            self.agent_url.trim_end_matches('/'),
            self.instance_id,
            suffix,
            self.region
        )
    }

    async fn status(&self) -> Result<Value> {
        let response = self
            .client
            .get(self.url(""))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl InstanceProvider for Ec2Instance {
    async fn start(&self) -> Result<()> {
        self.client
            .post(self.url("/start"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.client
            .post(self.url("/stop"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        let status = self.status().await?;
        Ok(status
            .get("running")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn get_ip(&self) -> Result<String> {
        let status = self.status().await?;
        status
            .get("ip")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                BellowsError::Instance(format!("instance {} has no ip", self.instance_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_confs() {
        let confs = json!({"instance_id": "i-1", "region": "us-east-2"});
        let instance = Ec2Instance::from_confs(&confs).unwrap();
        assert_eq!(instance.instance_id, "i-1");
        assert_eq!(instance.region, "us-east-2");
    }

    #[test]
    fn test_from_confs_missing_fields() {
        assert!(Ec2Instance::from_confs(&json!({"region": "us-east-2"})).is_err());
        assert!(Ec2Instance::from_confs(&json!({"instance_id": "i-1"})).is_err());
    }

    #[test]
    fn test_instance_type_parse() {
        assert_eq!("ec2".parse::<InstanceType>().unwrap(), InstanceType::Ec2);
        assert!("gce".parse::<InstanceType>().is_err());
    }
}
