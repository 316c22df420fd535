//! Host transport configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Device filters (VID:PID patterns), empty = all devices
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub usbfs: UsbfsSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// How a device-root candidate is verified before use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootCheck {
    /// The path only has to be an existing directory (udev-managed nodes)
    Directory,
    /// The path must be a mounted usbfs (filesystem magic check)
    UsbfsMagic,
}

/// A well-known location of the usbfs device tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootCandidate {
    pub path: PathBuf,
    pub check: RootCheck,
}

/// Where to look for (and possibly mount) the usbfs device tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbfsSettings {
    /// Candidates tried in order
    #[serde(default = "UsbfsSettings::default_roots")]
    pub roots: Vec<RootCandidate>,
    /// Mount table searched for a usbfs mount point
    #[serde(default = "UsbfsSettings::default_mounts_file")]
    pub mounts_file: PathBuf,
    /// Allow mounting usbfs at `mount_point` as a last resort
    #[serde(default = "UsbfsSettings::default_allow_mount")]
    pub allow_mount: bool,
    /// Private mount point used when nothing else is found
    #[serde(default = "UsbfsSettings::default_mount_point")]
    pub mount_point: PathBuf,
    /// sysfs path templates for a device; `{bus}`, `{device}` and `{minor}`
    /// are substituted
    #[serde(default = "UsbfsSettings::default_sysfs_templates")]
    pub sysfs_templates: Vec<String>,
}

impl Default for UsbfsSettings {
    fn default() -> Self {
        Self {
            roots: Self::default_roots(),
            mounts_file: Self::default_mounts_file(),
            allow_mount: Self::default_allow_mount(),
            mount_point: Self::default_mount_point(),
            sysfs_templates: Self::default_sysfs_templates(),
        }
    }
}

impl UsbfsSettings {
    fn default_roots() -> Vec<RootCandidate> {
        vec![
            RootCandidate {
                path: PathBuf::from("/dev/bus/usb"),
                check: RootCheck::Directory,
            },
            RootCandidate {
                path: PathBuf::from("/proc/bus/usb"),
                check: RootCheck::UsbfsMagic,
            },
        ]
    }

    fn default_mounts_file() -> PathBuf {
        PathBuf::from("/proc/mounts")
    }

    fn default_allow_mount() -> bool {
        true
    }

    fn default_mount_point() -> PathBuf {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            runtime_dir.join("usbfs-host").join("usbfs")
        } else {
            PathBuf::from("/run/usbfs-host/usbfs")
        }
    }

    fn default_sysfs_templates() -> Vec<String> {
        vec![
            "/sys/dev/char/189:{minor}".to_string(),
            "/sys/class/usb_device/usbdev{bus}.{device}/device".to_string(),
            "/sys/class/usb_endpoint/usbdev{bus}.{device}-ep00/device".to_string(),
        ]
    }
}

/// Completion-notification strategy for monitored input endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorStrategy {
    /// A real-time signal per endpoint, raised by the kernel on completion
    Signal,
    /// One shared watch on the device file becoming writable
    OutputReady,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Monitor strategy; unset means the build default
    #[serde(default)]
    pub monitor: Option<MonitorStrategy>,
    /// Input requests kept in flight per monitored endpoint
    #[serde(default = "TransferSettings::default_input_requests")]
    pub input_requests: usize,
    /// Delay between non-blocking reaps while cancelling a request
    #[serde(default = "TransferSettings::default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            monitor: None,
            input_requests: Self::default_input_requests(),
            cancel_poll_ms: Self::default_cancel_poll_ms(),
        }
    }
}

impl TransferSettings {
    fn default_input_requests() -> usize {
        8
    }

    fn default_cancel_poll_ms() -> u64 {
        1
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            logging: LoggingSettings::default(),
            usbfs: UsbfsSettings::default(),
            transfer: TransferSettings::default(),
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbfs-host/host.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a user supplied path string (`~` is expanded)
    pub fn load_from(path: &str) -> Result<Self> {
        let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
        Self::load(Some(path_buf))
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbfs-host").join("host.toml")
        } else {
            PathBuf::from(".config/usbfs-host/host.toml")
        }
    }

    /// Parsed device filters
    pub fn device_filters(&self) -> crate::Result<Vec<DeviceFilter>> {
        self.filters.iter().map(|f| DeviceFilter::parse(f)).collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.transfer.input_requests == 0 {
            return Err(anyhow!("transfer.input_requests must be at least 1"));
        }

        if self.usbfs.roots.is_empty() && !self.usbfs.allow_mount {
            return Err(anyhow!(
                "usbfs.roots is empty and mounting is disabled, no device root can be found"
            ));
        }

        for template in &self.usbfs.sysfs_templates {
            if !template.starts_with('/') {
                return Err(anyhow!("sysfs template '{}' must be absolute", template));
            }
        }

        self.device_filters()?;

        Ok(())
    }
}

/// VID:PID device filter
///
/// Format: `"0xVID:0xPID"`, either side may be `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    pub fn parse(filter: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(crate::Error::Filter {
                filter: filter.to_string(),
                reason: "expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')".to_string(),
            });
        }

        Ok(Self {
            vendor_id: Self::parse_id(filter, parts[0], "VID")?,
            product_id: Self::parse_id(filter, parts[1], "PID")?,
        })
    }

    fn parse_id(filter: &str, id: &str, name: &str) -> crate::Result<Option<u16>> {
        if id == "*" {
            return Ok(None);
        }

        let invalid = |reason: String| crate::Error::Filter {
            filter: filter.to_string(),
            reason,
        };

        let hex_part = id
            .strip_prefix("0x")
            .or_else(|| id.strip_prefix("0X"))
            .ok_or_else(|| invalid(format!("{} '{}' must start with '0x'", name, id)))?;

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(invalid(format!("{} '{}' must have 1-4 hex digits", name, id)));
        }

        u16::from_str_radix(hex_part, 16)
            .map(Some)
            .map_err(|_| invalid(format!("{} '{}' is not a valid hex number", name, id)))
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    /// True when `filters` is empty or any filter matches
    pub fn any_matches(filters: &[DeviceFilter], vendor_id: u16, product_id: u16) -> bool {
        filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
    }
}
