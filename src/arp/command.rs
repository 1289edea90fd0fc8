use crate::{config::ArpConfig, error::DiscoveryError};
use async_trait::async_trait;
use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

/// Anything that can produce a textual dump of the system ARP table.
#[async_trait]
pub trait ArpTableSource: Send + Sync {
    async fn query(&self, timeout: Duration) -> Result<String, DiscoveryError>;
}

const ARP_LOCATIONS: &[&str] = &[
    "/usr/sbin/arp",
    "/sbin/arp",
    "/usr/bin/arp",
    "/bin/arp",
    r"C:\Windows\System32\arp.exe",
];

const IP_LOCATIONS: &[&str] = &["/usr/sbin/ip", "/sbin/ip", "/usr/bin/ip", "/bin/ip"];

/// Runs an external ARP tool as a subprocess.
#[derive(Debug, Clone)]
pub struct ArpCommand {
    path: PathBuf,
    args: Vec<String>,
}

impl ArpCommand {
    pub fn new(path: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            args,
        }
    }

    /// Resolves the command to run from `config`.
    ///
    /// An explicit `config.command` wins. Otherwise `arp` is searched in the
    /// usual system locations and on `PATH`; when it is missing (minimal
    /// Linux installs ship without net-tools) `ip neigh show` is used.
    pub fn locate(config: &ArpConfig) -> Result<Self, DiscoveryError> {
        if let Some(path) = &config.command {
            return Ok(Self::new(path.clone(), config.args.clone()));
        }

        if let Some(path) = find_executable(ARP_LOCATIONS, &["arp", "arp.exe"]) {
            tracing::debug!("Using ARP command at {}", path.display());
            return Ok(Self::new(path, config.args.clone()));
        }

        if let Some(path) = find_executable(IP_LOCATIONS, &["ip"]) {
            tracing::debug!("arp not found, falling back to {} neigh show", path.display());
            return Ok(Self::new(path, vec!["neigh".into(), "show".into()]));
        }

        Err(DiscoveryError::ArpCommandNotFound)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

fn find_executable(locations: &[&str], names: &[&str]) -> Option<PathBuf> {
    let known = locations.iter().map(PathBuf::from);
    let on_path = env::var_os("PATH")
        .map(|paths| {
            env::split_paths(&paths)
                .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    known.chain(on_path).find(|candidate| candidate.is_file())
}

#[async_trait]
impl ArpTableSource for ArpCommand {
    async fn query(&self, timeout: Duration) -> Result<String, DiscoveryError> {
        tracing::trace!("Running {} {:?}", self.path.display(), self.args);

        let output = tokio::process::Command::new(&self.path)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, output).await {
            Ok(result) => result?,
            Err(_) => return Err(DiscoveryError::ArpCommandTimeout(timeout)),
        };

        if !output.status.success() {
            return Err(DiscoveryError::ArpCommandFailed {
                path: self.path.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
