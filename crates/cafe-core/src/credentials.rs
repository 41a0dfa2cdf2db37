// crates/cafe-core/src/credentials.rs

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// A named connection as stored by the orchestration environment.
#[derive(Clone, Default, Deserialize)]
pub struct ConnectionProfile {
    #[serde(default)]
    pub conn_type: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// JSON-encoded extra attributes. Stores may hold it as a string or as
    /// an inline object; both are normalised to a JSON string.
    #[serde(default, deserialize_with = "extra_as_json_string")]
    pub extra: Option<String>,
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("conn_type", &self.conn_type)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("extra", &self.extra)
            .finish()
    }
}

fn extra_as_json_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// Lookup of connection profiles by identifier.
pub trait ProfileStore: Send + Sync {
    fn get_connection(&self, conn_id: &str) -> Result<Option<ConnectionProfile>>;
}

/// Reads `AIRFLOW_CONN_<ID>` style variables holding JSON connections.
#[derive(Debug, Clone)]
pub struct EnvProfileStore {
    prefix: String,
}

impl Default for EnvProfileStore {
    fn default() -> Self {
        Self::with_prefix("AIRFLOW_CONN_")
    }
}

impl EnvProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_name(&self, conn_id: &str) -> String {
        let suffix: String = conn_id
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() {
                    ch.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl ProfileStore for EnvProfileStore {
    fn get_connection(&self, conn_id: &str) -> Result<Option<ConnectionProfile>> {
        let name = self.variable_name(conn_id);
        let Ok(raw) = env::var(&name) else {
            return Ok(None);
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| PipelineError::MalformedProfile {
                conn_id: conn_id.to_string(),
                reason: format!("{name} does not hold a JSON connection: {err}"),
            })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    connections: HashMap<String, ConnectionProfile>,
}

/// Profiles read from a TOML file with one `[connections.<id>]` table each.
#[derive(Debug, Default)]
pub struct TomlProfileStore {
    profiles: HashMap<String, ConnectionProfile>,
}

impl TomlProfileStore {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::Config(format!(
                "failed to read connections file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let file: ProfileFile =
            toml::from_str(text).map_err(|err| PipelineError::Config(err.to_string()))?;
        Ok(Self {
            profiles: file.connections,
        })
    }
}

impl ProfileStore for TomlProfileStore {
    fn get_connection(&self, conn_id: &str) -> Result<Option<ConnectionProfile>> {
        Ok(self.profiles.get(conn_id).cloned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticProfileStore {
    profiles: HashMap<String, ConnectionProfile>,
}

impl StaticProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, conn_id: impl Into<String>, profile: ConnectionProfile) -> Self {
        self.profiles.insert(conn_id.into(), profile);
        self
    }
}

impl ProfileStore for StaticProfileStore {
    fn get_connection(&self, conn_id: &str) -> Result<Option<ConnectionProfile>> {
        Ok(self.profiles.get(conn_id).cloned())
    }
}

/// Credentials for one warehouse session.
#[derive(Clone, PartialEq, Eq)]
pub struct WarehouseCredentials {
    pub login: String,
    pub secret: String,
    pub account: String,
    /// Never populated from a profile; account identifiers carry their region.
    pub region: Option<String>,
}

impl fmt::Debug for WarehouseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseCredentials")
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .field("account", &self.account)
            .field("region", &self.region)
            .finish()
    }
}

pub fn resolve_credentials(store: &dyn ProfileStore, conn_id: &str) -> Result<WarehouseCredentials> {
    let profile = store
        .get_connection(conn_id)?
        .ok_or_else(|| PipelineError::ConnectionNotFound {
            conn_id: conn_id.to_string(),
        })?;

    let malformed = |reason: String| PipelineError::MalformedProfile {
        conn_id: conn_id.to_string(),
        reason,
    };

    let login = non_empty(profile.login).ok_or_else(|| malformed("login is missing".into()))?;
    let secret =
        non_empty(profile.password).ok_or_else(|| malformed("password is missing".into()))?;
    let extra = profile
        .extra
        .ok_or_else(|| malformed("extra attributes are missing".into()))?;
    let account = account_from_extra(&extra).map_err(malformed)?;

    debug!(conn_id, account = %account, "resolved warehouse credentials");

    Ok(WarehouseCredentials {
        login,
        secret,
        account,
        region: None,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

fn account_from_extra(extra: &str) -> std::result::Result<String, String> {
    let value: Value =
        serde_json::from_str(extra).map_err(|err| format!("extra is not valid JSON: {err}"))?;
    let Value::Object(map) = value else {
        return Err("extra must be a JSON object".to_string());
    };

    let account = map
        .get("account")
        .or_else(|| map.get("extra__snowflake__account"));

    match account {
        Some(Value::String(account)) if !account.trim().is_empty() => {
            Ok(account.trim().to_string())
        }
        Some(_) => Err("`account` must be a non-empty string".to_string()),
        None => Err("extra has no `account` attribute".to_string()),
    }
}
