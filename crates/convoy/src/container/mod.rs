//! Thin async wrapper over the `docker`/`podman` CLI.
//!
//! In container mode every tenant slot is one long-lived container. Only the
//! handful of verbs the allocator uses are exposed.

mod container;
mod error;

pub use container::{
    Container, ContainerConfig, ContainerState, PortMapping, parse_container_list,
    parse_label_string, validate_container_name,
};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    #[default]
    Podman,
}

impl RuntimeType {
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether bind mounts need the SELinux `:Z` relabel suffix.
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Container IDs are hex; names are alphanumeric with `-`, `_` and `.`.
fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }
    validate_container_name(id)
}

/// Docker says "No such object"/"No such container", podman "no such container".
fn reports_missing_container(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

/// The verbs the isolation allocator needs from a runtime.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn start_container(&self, container_id: &str) -> ContainerResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn list_containers(&self, all: bool) -> ContainerResult<Vec<Container>>;
    /// `Ok(None)` only when the runtime says the container does not exist;
    /// any other failure is an error.
    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>>;
}

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Prefer podman when both are installed.
    pub fn new() -> Self {
        let runtime_type = if Self::is_binary_available("podman") {
            RuntimeType::Podman
        } else if Self::is_binary_available("docker") {
            RuntimeType::Docker
        } else {
            RuntimeType::Podman
        };
        Self::with_type(runtime_type)
    }

    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary, mapping spawn failures to `CommandFailed`.
    async fn run<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error too.
    async fn run_checked<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<Output> {
        let output = self.run(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Check that the runtime answers at all.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self
            .run_checked("version", &["version", "--format", "json"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `run -d` followed by flags, image and command. Map-backed flags are
    /// sorted so the same config always yields the same arguments.
    fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut flags: Vec<(&str, String)> = Vec::new();
        let optional = [
            ("--name", &config.name),
            ("--network", &config.network),
            ("--ip", &config.ip),
        ];
        flags.extend(
            optional
                .into_iter()
                .filter_map(|(flag, value)| value.clone().map(|v| (flag, v))),
        );
        flags.extend(
            config
                .ports
                .iter()
                .map(|p| ("-p", format!("{}:{}", p.host_port, p.container_port))),
        );
        let relabel = if self.runtime_type.needs_selinux_labels() {
            ":Z"
        } else {
            ""
        };
        flags.extend(
            config
                .volumes
                .iter()
                .map(|(host, guest)| ("-v", format!("{host}:{guest}{relabel}"))),
        );

        let mut env: Vec<_> = config.env.iter().collect();
        env.sort();
        flags.extend(env.into_iter().map(|(k, v)| ("-e", format!("{k}={v}"))));

        let mut labels: Vec<_> = config.labels.iter().collect();
        labels.sort();
        flags.extend(labels.into_iter().map(|(k, v)| ("--label", format!("{k}={v}"))));

        let mut args = vec!["run".to_string(), "-d".to_string()];
        for (flag, value) in flags {
            args.push(flag.to_string());
            args.push(value);
        }
        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }

    /// Create and start a container, returning its ID.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        let args = self.run_args(config);
        let output = self.run_checked("run", &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        self.run_checked("start", &["start", container_id]).await?;
        Ok(())
    }

    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["stop".to_string()];
        if let Some(t) = timeout {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.run_checked("stop", &args).await?;
        Ok(())
    }

    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);

        self.run_checked("rm", &args).await?;
        Ok(())
    }

    pub async fn list_containers(&self, all: bool) -> ContainerResult<Vec<Container>> {
        let mut args = vec!["ps", "--format", "json", "--no-trunc"];
        if all {
            args.push("-a");
        }

        let output = self.run_checked("ps", &args).await?;
        parse_container_list(&String::from_utf8_lossy(&output.stdout))
    }

    /// The container's `State.Status` (e.g. "running", "exited").
    pub async fn container_state_status(
        &self,
        id_or_name: &str,
    ) -> ContainerResult<Option<String>> {
        validate_container_id_or_name(id_or_name)?;

        let output = self
            .run(
                "inspect",
                &["inspect", "--format", "{{.State.Status}}", id_or_name],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if reports_missing_container(&stderr) {
                return Ok(None);
            }
            return Err(ContainerError::CommandFailed {
                command: "inspect".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let status = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        Ok((!status.is_empty()).then_some(status))
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn start_container(&self, container_id: &str) -> ContainerResult<()> {
        self.start_container(container_id).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }

    async fn list_containers(&self, all: bool) -> ContainerResult<Vec<Container>> {
        self.list_containers(all).await
    }

    async fn container_state_status(&self, id_or_name: &str) -> ContainerResult<Option<String>> {
        self.container_state_status(id_or_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful where docker or podman is installed.
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_run_args_include_labels_and_ip() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        let config = ContainerConfig::new("driver:latest")
            .name("convoy-alice")
            .network("convoy")
            .ip("10.89.0.2")
            .port(40000, 9222)
            .volume("/srv/convoy/users/alice/data", "/data")
            .label("convoy.user_id", "alice");

        let args = runtime.run_args(&config);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name convoy-alice --network convoy --ip 10.89.0.2"));
        assert!(joined.contains("-p 40000:9222"));
        assert!(joined.contains("-v /srv/convoy/users/alice/data:/data "));
        assert!(joined.contains("--label convoy.user_id=alice"));
        assert_eq!(args.last().map(String::as_str), Some("driver:latest"));
    }

    #[test]
    fn test_only_missing_container_is_absent() {
        assert!(reports_missing_container(
            "Error response from daemon: No such container: convoy-alice"
        ));
        assert!(reports_missing_container("Error: No such object: convoy-alice"));
        assert!(reports_missing_container(
            "Error: no such container convoy-alice"
        ));
        assert!(!reports_missing_container(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock"
        ));
        assert!(!reports_missing_container(""));
    }

    #[test]
    fn test_podman_volumes_are_relabelled() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Podman);
        let config = ContainerConfig::new("driver").volume("/host", "/data");
        assert!(runtime.run_args(&config).contains(&"/host:/data:Z".to_string()));
    }
}
