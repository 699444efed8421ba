//! Configuration types for compute sessions.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::{DeviceLimits, DeviceRequest};

fn default_label() -> String {
    "gpu-compute".to_string()
}

fn default_timestamp_period() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Optional device capability that must be negotiated at acquisition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Query sets and timestamp writes at compute pass boundaries.
    TimestampQuery,
    /// Timestamp writes recorded directly on the command encoder.
    TimestampQueryInsideEncoders,
    /// Half-precision arithmetic in shaders.
    ShaderF16,
}

impl Capability {
    /// Every capability this crate knows how to negotiate.
    pub const ALL: [Capability; 3] = [
        Capability::TimestampQuery,
        Capability::TimestampQueryInsideEncoders,
        Capability::ShaderF16,
    ];

    /// WebGPU feature name.
    pub fn name(self) -> &'static str {
        match self {
            Capability::TimestampQuery => "timestamp-query",
            Capability::TimestampQueryInsideEncoders => "timestamp-query-inside-encoders",
            Capability::ShaderF16 => "shader-f16",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of negotiated capabilities.
pub type CapabilitySet = BTreeSet<Capability>;

/// Which device back-end a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Host emulation, always available.
    #[default]
    Software,
    /// Real GPU through wgpu.
    Wgpu,
}

/// Adapter selection hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
}

/// Numeric limits a caller requires of the device.
///
/// `None` means "WebGPU default, capped at what the adapter offers".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitRequest {
    #[serde(default)]
    pub max_buffer_size: Option<u64>,
    #[serde(default)]
    pub max_storage_buffer_binding_size: Option<u64>,
    #[serde(default)]
    pub max_compute_workgroups_per_dimension: Option<u32>,
}

/// Description of the emulated adapter used by the software back-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareProfile {
    /// Capabilities the emulated adapter advertises.
    #[serde(default = "default_software_capabilities")]
    pub capabilities: Vec<Capability>,
    /// Limits the emulated adapter advertises.
    #[serde(default = "default_software_limits")]
    pub limits: DeviceLimits,
    /// Nanoseconds per timestamp tick.
    #[serde(default = "default_timestamp_period")]
    pub timestamp_period_ns: f32,
    /// When false, adapter requests fail as if no GPU were present.
    #[serde(default = "default_true")]
    pub adapter_available: bool,
}

fn default_software_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

fn default_software_limits() -> DeviceLimits {
    DeviceLimits::WEBGPU_DEFAULT
}

impl Default for SoftwareProfile {
    fn default() -> Self {
        Self {
            capabilities: default_software_capabilities(),
            limits: default_software_limits(),
            timestamp_period_ns: default_timestamp_period(),
            adapter_available: true,
        }
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Device label reported to the driver.
    #[serde(default = "default_label")]
    pub label: String,
    /// Device back-end.
    #[serde(default)]
    pub backend: BackendKind,
    /// Adapter selection hint (wgpu only).
    #[serde(default)]
    pub power_preference: PowerPreference,
    /// Optional capabilities the device must grant.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Limits the device must grant.
    #[serde(default)]
    pub limits: LimitRequest,
    /// Emulated adapter (software back-end only).
    #[serde(default)]
    pub software: SoftwareProfile,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            backend: BackendKind::Software,
            power_preference: PowerPreference::HighPerformance,
            capabilities: vec![Capability::TimestampQuery],
            limits: LimitRequest::default(),
            software: SoftwareProfile::default(),
        }
    }
}

impl SessionConfig {
    /// Read and validate a JSON configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: SessionConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.label.trim().is_empty() {
            return Err(ConfigError::EmptyLabel);
        }

        let mut seen = CapabilitySet::new();
        for &capability in &self.capabilities {
            if !seen.insert(capability) {
                return Err(ConfigError::DuplicateCapability(capability));
            }
        }

        let limits = &self.limits;
        if limits.max_buffer_size == Some(0) {
            return Err(ConfigError::ZeroLimit("max_buffer_size"));
        }
        if limits.max_storage_buffer_binding_size == Some(0) {
            return Err(ConfigError::ZeroLimit("max_storage_buffer_binding_size"));
        }
        if limits.max_compute_workgroups_per_dimension == Some(0) {
            return Err(ConfigError::ZeroLimit("max_compute_workgroups_per_dimension"));
        }

        if !(self.software.timestamp_period_ns > 0.0) {
            return Err(ConfigError::InvalidTimestampPeriod(
                self.software.timestamp_period_ns,
            ));
        }
        Ok(())
    }

    /// Negotiation table handed to the device session.
    pub fn device_request(&self) -> DeviceRequest {
        DeviceRequest {
            label: self.label.clone(),
            power_preference: self.power_preference,
            capabilities: self.capabilities.iter().copied().collect(),
            limits: self.limits,
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Device label must be non-empty")]
    EmptyLabel,
    #[error("Capability {0} requested more than once")]
    DuplicateCapability(Capability),
    #[error("Limit {0} must be non-zero when requested")]
    ZeroLimit(&'static str),
    #[error("Timestamp period must be positive, got {0}")]
    InvalidTimestampPeriod(f32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendKind::Software);
    }

    #[test]
    fn test_capability_names_are_kebab_case() {
        let json = serde_json::to_string(&Capability::ALL).unwrap();
        assert_eq!(
            json,
            r#"["timestamp-query","timestamp-query-inside-encoders","shader-f16"]"#
        );
        for capability in Capability::ALL {
            assert_eq!(
                serde_json::to_string(&capability).unwrap(),
                format!("\"{}\"", capability.name())
            );
        }
    }

    #[test]
    fn test_duplicate_capability_rejected() {
        let config = SessionConfig {
            capabilities: vec![Capability::ShaderF16, Capability::ShaderF16],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateCapability(Capability::ShaderF16))
        ));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = SessionConfig {
            limits: LimitRequest {
                max_buffer_size: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit("max_buffer_size"))
        ));
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.label, "gpu-compute");
        assert!(config.capabilities.is_empty());
        assert_eq!(config.software.capabilities.len(), 3);
        assert!(config.software.adapter_available);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_device_request_echoes_config() {
        let config = SessionConfig {
            capabilities: vec![Capability::TimestampQuery, Capability::ShaderF16],
            limits: LimitRequest {
                max_buffer_size: Some(1 << 20),
                ..Default::default()
            },
            ..Default::default()
        };
        let request = config.device_request();
        assert!(request.capabilities.contains(&Capability::ShaderF16));
        assert_eq!(request.limits.max_buffer_size, Some(1 << 20));
        assert_eq!(request.label, config.label);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"backend": "wgpu", "capabilities": ["timestamp-query"], "limits": {{"max_buffer_size": 4096}}}}"#
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Wgpu);
        assert_eq!(config.capabilities, vec![Capability::TimestampQuery]);
        assert_eq!(config.limits.max_buffer_size, Some(4096));
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
