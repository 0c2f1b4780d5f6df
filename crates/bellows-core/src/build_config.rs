//! In-repo build config parsing.
//!
//! The build config is a yaml document declaring builders:
//!
//! ```yaml
//! builders:
//!   - name: unit
//!     branches: [main, "release/*"]
//!   - name: deploy
//!     triggered_by:
//!       - builder_name: unit
//!         statuses: [success]
//! ```
//!
//! Builders may restrict themselves to branches with glob patterns; a
//! builder without a `branches` key applies to every branch.

use glob::Pattern;
use serde_yaml::Value;

use crate::error::{BellowsError, Result};
use crate::models::{BuildStatus, BuildTrigger};

/// A builder entry from the config, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderConf {
    pub name: String,
    pub triggered_by: Vec<BuildTrigger>,
}

/// Parses raw build config content.
pub fn load_config(raw: &str) -> Result<Value> {
    serde_yaml::from_str(raw).map_err(|e| BellowsError::BadBuildConfig(e.to_string()))
}

/// Lists the builders from `conf` that apply to `branch`, in declaration
/// order.
pub fn list_builders_from_config(conf: &Value, branch: &str) -> Result<Vec<BuilderConf>> {
    let builders = conf
        .get("builders")
        .ok_or_else(|| BellowsError::BadBuildConfig("no builders section".to_string()))?
        .as_sequence()
        .ok_or_else(|| BellowsError::BadBuildConfig("builders is not a list".to_string()))?;

    let mut confs = Vec::new();
    for entry in builders {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BellowsError::BadBuildConfig("builder without a name".to_string()))?;

        if !branch_applies(entry, branch) {
            continue;
        }

        confs.push(BuilderConf {
            name: name.to_string(),
            triggered_by: parse_triggers(entry)?,
        });
    }

    Ok(confs)
}

fn branch_applies(entry: &Value, branch: &str) -> bool {
    let patterns = match entry.get("branches").and_then(Value::as_sequence) {
        Some(patterns) => patterns,
        None => return true,
    };

    patterns
        .iter()
        .filter_map(Value::as_str)
        .any(|p| match Pattern::new(p) {
            Ok(pattern) => pattern.matches(branch),
            Err(_) => p == branch,
        })
}

fn parse_triggers(entry: &Value) -> Result<Vec<BuildTrigger>> {
    let triggers = match entry.get("triggered_by").and_then(Value::as_sequence) {
        Some(triggers) => triggers,
        None => return Ok(Vec::new()),
    };

    triggers
        .iter()
        .map(|t| {
            let builder_name = t
                .get("builder_name")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    BellowsError::BadBuildConfig("trigger without builder_name".to_string())
                })?;
            let statuses = t
                .get("statuses")
                .and_then(Value::as_sequence)
                .map(|statuses| {
                    statuses
                        .iter()
                        .filter_map(Value::as_str)
                        .filter_map(|s| s.parse::<BuildStatus>().ok())
                        .collect()
                })
                .unwrap_or_default();

            Ok(BuildTrigger {
                builder_name: builder_name.to_string(),
                statuses,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_builders_all_branches() {
        let conf = load_config("builders:\n  - name: a\n  - name: b\n").unwrap();
        let builders = list_builders_from_config(&conf, "main").unwrap();
        assert_eq!(builders.len(), 2);
        assert_eq!(builders[0].name, "a");
        assert_eq!(builders[1].name, "b");
    }

    #[test]
    fn test_list_builders_branch_filter() {
        let conf = load_config(
            "builders:\n  - name: a\n    branches: [main]\n  - name: b\n    branches: ['release/*']\n",
        )
        .unwrap();

        let on_main = list_builders_from_config(&conf, "main").unwrap();
        assert_eq!(on_main.len(), 1);
        assert_eq!(on_main[0].name, "a");

        let on_release = list_builders_from_config(&conf, "release/1.2").unwrap();
        assert_eq!(on_release.len(), 1);
        assert_eq!(on_release[0].name, "b");

        assert!(list_builders_from_config(&conf, "feature/x").unwrap().is_empty());
    }

    #[test]
    fn test_list_builders_triggered_by() {
        let conf = load_config(
            "builders:\n  - name: a\n  - name: b\n    triggered_by:\n      - builder_name: a\n        statuses: [success, warning]\n",
        )
        .unwrap();

        let builders = list_builders_from_config(&conf, "main").unwrap();
        assert_eq!(builders[1].triggered_by.len(), 1);
        assert_eq!(builders[1].triggered_by[0].builder_name, "a");
        assert_eq!(
            builders[1].triggered_by[0].statuses,
            vec![BuildStatus::Success, BuildStatus::Warning]
        );
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let conf = load_config("builders: not-a-list\n").unwrap();
        assert!(list_builders_from_config(&conf, "main").is_err());

        let conf = load_config("language: python\n").unwrap();
        assert!(list_builders_from_config(&conf, "main").is_err());

        let conf = load_config("builders:\n  - branches: [main]\n").unwrap();
        assert!(list_builders_from_config(&conf, "main").is_err());
    }
}
