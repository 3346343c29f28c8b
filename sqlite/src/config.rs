//! Configuration for the runner, loaded from environment variables.

use ferry_engine::{ConflictAction, RowData, ScopeConfig, SyncOptions, TableConfig, DEFAULT_SCOPE_NAME};
use serde_json::Value;
use std::env;

/// Runner configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Database URL of the remote participant
    pub server_url: String,
    /// Database URL of the local participant
    pub client_url: String,
    pub scope: ScopeConfig,
    pub options: SyncOptions,
    /// Action for rows deleted locally but updated remotely
    pub on_local_no_row: Option<ConflictAction>,
    /// Log the tracking provisioning statements before synchronizing
    pub print_tracking: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let server_url = required("FERRY_SERVER_URL")?;
        let client_url = required("FERRY_CLIENT_URL")?;

        let mut scope = ScopeConfig::new(
            lookup("FERRY_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE_NAME.to_string()),
        );
        for table in parse_tables(&required("FERRY_TABLES")?)? {
            scope = scope.with_table(table);
        }

        let options = SyncOptions {
            parameters: lookup("FERRY_PARAMETERS")
                .map(|v| parse_parameters(&v))
                .transpose()?
                .unwrap_or_default(),
            cleanup_tombstones: parse_flag("FERRY_CLEANUP", lookup("FERRY_CLEANUP"))?,
        };

        let on_local_no_row = lookup("FERRY_ON_LOCAL_NO_ROW")
            .map(|v| {
                v.parse()
                    .map_err(|reason| ConfigError::Invalid { key: "FERRY_ON_LOCAL_NO_ROW", reason })
            })
            .transpose()?;

        Ok(Self {
            server_url,
            client_url,
            scope,
            options,
            on_local_no_row,
            print_tracking: parse_flag("FERRY_PRINT_TRACKING", lookup("FERRY_PRINT_TRACKING"))?,
        })
    }
}

/// `Products:clientId,Orders:clientId+region,Settings`
fn parse_tables(value: &str) -> Result<Vec<TableConfig>, ConfigError> {
    let mut tables = Vec::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, filters) = match entry.split_once(':') {
            Some((name, filters)) => (name.trim(), filters),
            None => (entry, ""),
        };
        if name.is_empty() {
            return Err(ConfigError::Invalid {
                key: "FERRY_TABLES",
                reason: format!("entry '{}' has no table name", entry),
            });
        }
        let table = filters
            .split('+')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .fold(TableConfig::new(name), |table, f| table.with_filter(f));
        tables.push(table);
    }

    if tables.is_empty() {
        return Err(ConfigError::Invalid {
            key: "FERRY_TABLES",
            reason: "no tables listed".into(),
        });
    }
    Ok(tables)
}

/// `clientId=42,region="eu"`; values that are not JSON are taken as strings.
fn parse_parameters(value: &str) -> Result<RowData, ConfigError> {
    let mut parameters = RowData::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (column, raw) = entry.split_once('=').ok_or_else(|| ConfigError::Invalid {
            key: "FERRY_PARAMETERS",
            reason: format!("expected column=value, got '{}'", entry),
        })?;
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        parameters.insert(column.trim().to_string(), value);
    }
    Ok(parameters)
}

fn parse_flag(key: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                reason: format!("expected a boolean, got '{}'", v),
            }),
        },
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const BASE: [(&str, &str); 3] = [
        ("FERRY_SERVER_URL", "sqlite://server.db"),
        ("FERRY_CLIENT_URL", "sqlite://client.db"),
        ("FERRY_TABLES", "Products:clientId, Orders:clientId+region, Settings"),
    ];

    #[test]
    fn test_minimal_config() {
        let config = load(&BASE).unwrap();

        assert_eq!(config.scope.name, DEFAULT_SCOPE_NAME);
        assert_eq!(config.scope.tables.len(), 3);
        assert_eq!(config.scope.tables[0].filter_columns, vec!["clientId"]);
        assert_eq!(config.scope.tables[1].filter_columns, vec!["clientId", "region"]);
        assert!(config.scope.tables[2].filter_columns.is_empty());
        assert_eq!(config.options, SyncOptions::default());
        assert_eq!(config.on_local_no_row, None);
        assert!(!config.print_tracking);
    }

    #[test]
    fn test_full_config() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("FERRY_SCOPE", "Sales"),
            ("FERRY_PARAMETERS", "clientId=42, region=eu, code=\"007\""),
            ("FERRY_ON_LOCAL_NO_ROW", "apply-remote"),
            ("FERRY_CLEANUP", "yes"),
            ("FERRY_PRINT_TRACKING", "1"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.scope.name, "Sales");
        assert_eq!(config.options.parameters.get("clientId"), Some(&json!(42)));
        assert_eq!(config.options.parameters.get("region"), Some(&json!("eu")));
        assert_eq!(config.options.parameters.get("code"), Some(&json!("007")));
        assert!(config.options.cleanup_tombstones);
        assert_eq!(config.on_local_no_row, Some(ConflictAction::ApplyRemote));
        assert!(config.print_tracking);
    }

    #[test]
    fn test_missing_urls() {
        let err = load(&BASE[1..]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FERRY_SERVER_URL")));

        let err = load(&BASE[..2]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("FERRY_TABLES")));
    }

    #[test]
    fn test_invalid_values() {
        let mut vars = BASE.to_vec();
        vars.push(("FERRY_ON_LOCAL_NO_ROW", "guess"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "FERRY_ON_LOCAL_NO_ROW", .. }
        ));

        let mut vars = BASE.to_vec();
        vars.push(("FERRY_PARAMETERS", "clientId"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "FERRY_PARAMETERS", .. }
        ));

        let mut vars = BASE.to_vec();
        vars.push(("FERRY_CLEANUP", "maybe"));
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "FERRY_CLEANUP", .. }
        ));

        vars[2] = ("FERRY_TABLES", ":clientId");
        assert!(matches!(
            load(&vars).unwrap_err(),
            ConfigError::Invalid { key: "FERRY_TABLES", .. }
        ));
    }
}
