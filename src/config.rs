use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tls::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config file {path:?} failed, {err}")]
    Read {
        path: PathBuf,
        err: std::io::Error,
    },
    #[error("parse config failed, {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config, {0}")]
    Invalid(&'static str),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// How requests to the Consul agent are authenticated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    /// Sent as `X-Consul-Token`.
    Token(String),
    Basic { username: String, password: String },
}

fn default_tag_separator() -> String {
    ",".to_string()
}

const fn default_allow_stale() -> bool {
    true
}

/// Consul service discovery retrieves targets from the Catalog API.
///
/// ```yaml
/// server: 127.0.0.1:8500
/// token: secret
/// datacenter: dc1
/// services:
///   - api
///   - db
/// tag: prod
/// refresh_interval: 30s
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the Consul agent, `host:port`.
    pub server: String,

    /// ACL token, sent with every request.
    pub token: Option<String>,

    /// Datacenter to query, the agent's own datacenter is used when omitted.
    pub datacenter: Option<String>,

    /// The string by which Consul tags are joined into the tag label.
    #[serde(default = "default_tag_separator")]
    pub tag_separator: String,

    #[serde(default)]
    pub scheme: Scheme,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Allow stale Consul results, which reduce load on Consul
    ///
    /// See https://developer.hashicorp.com/consul/api-docs/features/consistency
    #[serde(default = "default_allow_stale")]
    pub allow_stale: bool,

    /// The time after which the provided names are refreshed.
    /// On large setup it might be a good idea to increase this value because
    /// the catalog will change all the time.
    #[serde(default, with = "humanize::duration::serde")]
    pub refresh_interval: Duration,

    /// A list of services for which targets are retrieved. If omitted, all
    /// services are watched.
    #[serde(default)]
    pub services: Vec<String>,

    /// An optional tag used to filter instances inside a service.
    pub tag: Option<String>,

    pub tls: Option<TlsConfig>,
}

impl Config {
    /// A config with every optional field at its default.
    pub fn new(server: impl Into<String>) -> Self {
        Config {
            server: server.into(),
            token: None,
            datacenter: None,
            tag_separator: default_tag_separator(),
            scheme: Scheme::default(),
            username: None,
            password: None,
            allow_stale: default_allow_stale(),
            refresh_interval: Duration::ZERO,
            services: vec![],
            tag: None,
            tls: None,
        }
    }

    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        let config = serde_yaml::from_str::<Config>(input)?;
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            err,
        })?;

        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server must not be empty"));
        }

        match (&self.username, &self.password) {
            (Some(_), None) => return Err(ConfigError::Invalid("username requires a password")),
            (None, Some(_)) => return Err(ConfigError::Invalid("password requires a username")),
            _ => {}
        }

        Ok(())
    }

    /// Every configured credential. A token and basic auth may be set
    /// together, in which case both are sent.
    pub fn credentials(&self) -> Vec<Credentials> {
        let mut credentials = Vec::with_capacity(2);

        if let Some(token) = &self.token {
            credentials.push(Credentials::Token(token.clone()));
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            credentials.push(Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            });
        }

        credentials
    }

    /// The configured datacenter, an empty value counts as unset.
    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref().filter(|dc| !dc.is_empty())
    }

    /// The configured tag filter, an empty value counts as unset.
    pub fn watched_tag(&self) -> Option<&str> {
        self.tag.as_deref().filter(|tag| !tag.is_empty())
    }
}
