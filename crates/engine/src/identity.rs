//! Device identity.
//!
//! Every remote row is scoped to the device that wrote it. The identifier is
//! generated once per host and persisted, so that reinstalling the binary or
//! restarting the container keeps writing to the same partition.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::io;
use std::path::{Path, PathBuf};
use supabazarr_config::DeviceConfig;
use supabazarr_remote::models::{Device, DeviceId};
use time::OffsetDateTime;
use tracing::instrument;

const INTERFACES: [&str; 3] = ["eth0", "end0", "wlan0"];
const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Who this host is, resolved once per run and passed to everything that
/// talks to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub hostname: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
}

impl DeviceIdentity {
    /// Registration row for this device.
    pub fn device(&self, version: &str, last_backup_at: Option<OffsetDateTime>) -> Device {
        Device {
            device_id: self.device_id,
            hostname: self.hostname.clone(),
            mac_address: self.mac_address.clone(),
            ip_address: self.ip_address.clone(),
            version: version.to_string(),
            last_backup_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    path: PathBuf,
    pinned: Option<DeviceId>,
    hostname: Option<String>,
}

impl IdentityResolver {
    /// Resolve the identifier stored in (or generated into) `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), pinned: None, hostname: None }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self> {
        let mut resolver = Self::new(&config.identity_file);
        if let Some(id) = config.id.as_deref().filter(|id| !id.trim().is_empty()) {
            resolver.pinned = Some(id.parse::<DeviceId>().or_raise(|| ErrorKind::Config("device.id is not a UUID"))?);
        }
        resolver.hostname = config.hostname.clone().filter(|h| !h.trim().is_empty());
        Ok(resolver)
    }

    /// Use `id` instead of the persisted identifier.
    pub fn with_pinned_id(mut self, id: DeviceId) -> Self {
        self.pinned = Some(id);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn resolve(&self) -> Result<DeviceIdentity> {
        let device_id = match self.pinned {
            Some(id) => id,
            None => self.device_id().await?,
        };
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => system_hostname().await,
        };
        Ok(DeviceIdentity { device_id, hostname, mac_address: mac_address().await, ip_address: ip_address().await })
    }

    async fn device_id(&self) -> Result<DeviceId> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if !content.trim().is_empty() => {
                // Never overwrite an identifier we cannot read back.
                content.parse::<DeviceId>().or_raise(|| {
                    ErrorKind::IdentityUnavailable(format!("{} does not contain a device id", self.path.display()))
                })
            },
            Ok(_) => self.generate().await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.generate().await,
            Err(e) => Err(e).or_raise(|| {
                ErrorKind::IdentityUnavailable(format!("cannot read device id from {}", self.path.display()))
            }),
        }
    }

    async fn generate(&self) -> Result<DeviceId> {
        let id = DeviceId::random();
        self.persist(id).await.or_raise(|| {
            ErrorKind::IdentityUnavailable(format!("cannot write device id to {}", self.path.display()))
        })?;
        tracing::info!(device = %id, "Generated new device identity");
        Ok(id)
    }

    /// Write to a sibling temporary file, then rename over the target, so a
    /// crash never leaves a truncated identifier behind.
    async fn persist(&self, id: DeviceId) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, format!("{id}\n")).await?;
        tokio::fs::rename(&tmp, &self.path).await
    }
}

async fn system_hostname() -> String {
    for path in ["/proc/sys/kernel/hostname", "/etc/hostname"] {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            let name = content.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()).unwrap_or_else(|| "unknown".to_string())
}

async fn mac_address() -> Option<String> {
    for interface in INTERFACES {
        let path = Path::new("/sys/class/net").join(interface).join("address");
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            let mac = content.trim().to_lowercase();
            if !mac.is_empty() && mac != ZERO_MAC {
                return Some(mac);
            }
        }
    }
    None
}

/// Local address of the default route. Connecting a UDP socket only picks a
/// route; nothing is sent.
async fn ip_address() -> Option<String> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then(|| ip.to_string())
}
