//! What we send to the runtime and what we read back from `ps`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::error::{ContainerError, ContainerResult};

/// Docker prints `Names` as a comma-joined string, podman as an array.
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        Joined(String),
        List(Vec<String>),
        Missing(()),
    }

    Ok(match Names::deserialize(deserializer)? {
        Names::Joined(s) => s
            .split(',')
            .map(|n| n.trim().trim_start_matches('/').to_string())
            .filter(|n| !n.is_empty())
            .collect(),
        Names::List(list) => list
            .into_iter()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect(),
        Names::Missing(()) => Vec::new(),
    })
}

/// Docker prints `Labels` as `k=v,k2=v2`, podman as a JSON object (or null).
fn deserialize_labels<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Labels {
        Joined(String),
        Map(HashMap<String, String>),
        Missing(()),
    }

    Ok(match Labels::deserialize(deserializer)? {
        Labels::Joined(s) => parse_label_string(&s),
        Labels::Map(map) => map,
        Labels::Missing(()) => HashMap::new(),
    })
}

/// Parse docker's `k=v,k2=v2` label rendering.
pub fn parse_label_string(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// `-p host:container`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Arguments for `run -d`, built fluently and checked by [`validate`](Self::validate).
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// `(host, container)` bind mounts.
    pub volumes: Vec<(String, String)>,
    /// Labels, used to recover slot ownership after a restart.
    pub labels: HashMap<String, String>,
    /// User-defined network to attach to.
    pub network: Option<String>,
    /// Static address on `network`.
    pub ip: Option<String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
        }

        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }

        if let Some(ref network) = self.network {
            validate_container_name(network)?;
        }

        if let Some(ref ip) = self.ip {
            if self.network.is_none() {
                return Err(ContainerError::InvalidInput(
                    "a static ip requires a network".to_string(),
                ));
            }
            ip.parse::<std::net::Ipv4Addr>().map_err(|_| {
                ContainerError::InvalidInput(format!("'{}' is not an IPv4 address", ip))
            })?;
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.ports.push(PortMapping {
            host_port,
            container_port,
        });
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }
}

/// `State` as reported by `ps`; anything unrecognised is `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One entry of `ps --format json`, from either docker or podman.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub state: ContainerState,

    #[serde(default, deserialize_with = "deserialize_labels")]
    pub labels: HashMap<String, String>,
}

impl Container {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn primary_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(self.id.as_str())
    }
}

/// Parse `ps --format json` output.
///
/// Podman emits a single JSON array; docker emits one object per line.
pub fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

fn invalid(message: String) -> ContainerError {
    ContainerError::InvalidInput(message)
}

/// Shared shape check: non-empty, bounded, allowed alphabet, allowed first char.
fn check_token(
    what: &str,
    value: &str,
    max_len: usize,
    first: impl Fn(char) -> bool,
    rest: impl Fn(char) -> bool,
) -> ContainerResult<()> {
    let Some(head) = value.chars().next() else {
        return Err(invalid(format!("{what} is empty")));
    };
    if value.len() > max_len {
        return Err(invalid(format!("{what} is longer than {max_len} bytes")));
    }
    if !first(head) {
        return Err(invalid(format!("{what} '{value}' starts with '{head}'")));
    }
    if let Some(bad) = value.chars().find(|c| !rest(*c)) {
        return Err(invalid(format!("{what} '{value}' contains '{bad}'")));
    }
    Ok(())
}

/// `[registry/][namespace/]name[:tag][@digest]`, without path traversal.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    check_token(
        "image",
        image,
        256,
        |c| c.is_ascii_alphanumeric(),
        |c| c.is_ascii_alphanumeric() || ".-_/:@".contains(c),
    )?;
    if image.contains("..") {
        return Err(invalid(format!("image '{image}' contains '..'")));
    }
    Ok(())
}

/// Container and network names.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    check_token(
        "container name",
        name,
        128,
        |c| c.is_ascii_alphanumeric() || c == '_',
        |c| c.is_ascii_alphanumeric() || "-_.".contains(c),
    )
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    check_token(
        "env key",
        key,
        256,
        |c| c.is_ascii_alphabetic() || c == '_',
        |c| c.is_ascii_alphanumeric() || c == '_',
    )
}

/// Paths are passed as arguments, never through a shell, but a stray
/// metacharacter still means the config is wrong.
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(invalid(format!("{side} mount path is empty")));
    }
    if let Some(c) = path.chars().find(|c| "\0$`!&|;<>(){}*?\\\"'\n\r".contains(*c)) {
        return Err(invalid(format!("{side} mount path contains {c:?}")));
    }
    Ok(())
}

/// Docker renders labels as `k=v,k2=v2`, so values must not contain either separator.
fn validate_label(key: &str, value: &str) -> ContainerResult<()> {
    check_token(
        "label key",
        key,
        128,
        |c| c.is_ascii_alphanumeric(),
        |c| c.is_ascii_alphanumeric() || ".-_".contains(c),
    )?;
    if value.contains([',', '=', '\n', '\0']) {
        return Err(invalid(format!("label '{key}' has a reserved character in its value")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("ubuntu:latest").is_ok());
        assert!(validate_image_name("ghcr.io/convoy/driver@sha256:abc123").is_ok());
        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("convoy-alice").is_ok());
        assert!(validate_container_name("_private").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-dash").is_err());
        assert!(validate_container_name("$(whoami)").is_err());
    }

    #[test]
    fn test_config_rejects_ip_without_network() {
        let config = ContainerConfig::new("driver:latest").ip("10.89.0.2");
        assert!(config.validate().is_err());

        let config = ContainerConfig::new("driver:latest")
            .network("convoy")
            .ip("10.89.0.2")
            .label("convoy.user_id", "alice");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_label_value() {
        let config = ContainerConfig::new("driver:latest").label("convoy.user_id", "a,b=c");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_podman_array() {
        let stdout = r#"[{"Id":"abc123","Names":["convoy-alice"],"Image":"driver","State":"running",
            "Labels":{"convoy.user_id":"alice","convoy.address":"10.89.0.2"}}]"#;
        let containers = parse_container_list(stdout).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].primary_name(), "convoy-alice");
        assert!(containers[0].state.is_running());
        assert_eq!(containers[0].label("convoy.user_id"), Some("alice"));
    }

    #[test]
    fn test_parse_docker_lines() {
        let stdout = concat!(
            r#"{"ID":"abc","Names":"convoy-bob","State":"exited","Labels":"convoy.user_id=bob,convoy.port=40001"}"#,
            "\n",
            r#"{"ID":"def","Names":"other","State":"running","Labels":""}"#,
            "\n"
        );
        let containers = parse_container_list(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].label("convoy.port"), Some("40001"));
        assert_eq!(containers[0].state, ContainerState::Exited);
        assert!(containers[1].labels.is_empty());
    }

    #[test]
    fn test_parse_null_labels() {
        let stdout = r#"[{"Id":"abc","Names":null,"State":"weird","Labels":null}]"#;
        let containers = parse_container_list(stdout).unwrap();
        assert!(containers[0].labels.is_empty());
        assert_eq!(containers[0].state, ContainerState::Unknown);
        assert_eq!(containers[0].primary_name(), "abc");
    }
}
