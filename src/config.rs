use std::path::PathBuf;

use serde::Serialize;

use crate::util::{env_optional, env_u64, env_usize};

pub(crate) const DEFAULT_PORT: u16 = 8321;
pub(crate) const DEFAULT_MAX_DAT_SIZE: u64 = 1 << 30; // 1 GiB per segment
pub(crate) const DEFAULT_MAX_OPERATIONS: usize = 100;
pub(crate) const DEFAULT_MAX_METADATA_KEY_LENGTH: usize = 256;
pub(crate) const DEFAULT_MAX_METADATA_VALUE_BYTES: usize = 10 * 1024 * 1024;
pub(crate) const DEFAULT_LOG_FILE_MAX_READ_BYTES: u64 = 64 * 1024;
pub(crate) const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;

/// Process-wide limits and knobs. Built from CLI flags, with `DATVAULT_*`
/// environment variables filling anything the flags leave unset.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct ServerConfig {
    pub(crate) bind: String,
    pub(crate) port: u16,
    /// Set at startup or later, exactly once, via `POST /api/config`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) working_directory: Option<PathBuf>,
    pub(crate) max_dat_size: u64,
    /// 0 disables the disk quota entirely.
    pub(crate) max_disk_usage: u64,
    pub(crate) max_operations: usize,
    pub(crate) max_metadata_key_length: usize,
    pub(crate) max_metadata_value_bytes: usize,
    pub(crate) log_file_max_read_bytes: u64,
    pub(crate) max_login_attempts: u32,
    #[serde(skip)]
    pub(crate) admin_username: Option<String>,
    #[serde(skip)]
    pub(crate) admin_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            working_directory: None,
            max_dat_size: DEFAULT_MAX_DAT_SIZE,
            max_disk_usage: 0,
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_metadata_key_length: DEFAULT_MAX_METADATA_KEY_LENGTH,
            max_metadata_value_bytes: DEFAULT_MAX_METADATA_VALUE_BYTES,
            log_file_max_read_bytes: DEFAULT_LOG_FILE_MAX_READ_BYTES,
            max_login_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            admin_username: None,
            admin_password: None,
        }
    }
}

impl ServerConfig {
    /// Environment overrides for anything the CLI left at its default.
    pub(crate) fn apply_env(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.max_dat_size = env_u64("DATVAULT_MAX_DAT_SIZE", self.max_dat_size)?;
        self.max_disk_usage = env_u64("DATVAULT_MAX_DISK_USAGE", self.max_disk_usage)?;
        self.max_operations = env_usize("DATVAULT_MAX_OPERATIONS", self.max_operations)?;
        self.max_metadata_key_length = env_usize(
            "DATVAULT_MAX_METADATA_KEY_LENGTH",
            self.max_metadata_key_length,
        )?;
        self.max_metadata_value_bytes = env_usize(
            "DATVAULT_MAX_METADATA_VALUE_BYTES",
            self.max_metadata_value_bytes,
        )?;
        self.log_file_max_read_bytes = env_u64(
            "DATVAULT_LOG_FILE_MAX_READ_BYTES",
            self.log_file_max_read_bytes,
        )?;
        self.max_login_attempts =
            env_u64("DATVAULT_MAX_LOGIN_ATTEMPTS", self.max_login_attempts as u64)? as u32;
        if self.admin_username.is_none() {
            self.admin_username = env_optional("DATVAULT_ADMIN_USERNAME");
        }
        if self.admin_password.is_none() {
            self.admin_password = env_optional("DATVAULT_ADMIN_PASSWORD");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_disk_usage, 0);
        assert_eq!(config.max_operations, 100);
        assert_eq!(config.max_metadata_key_length, 256);
        assert_eq!(config.max_metadata_value_bytes, 10 * 1024 * 1024);
        assert!(config.working_directory.is_none());
    }

    #[test]
    fn test_serialized_config_hides_credentials() {
        let mut config = ServerConfig::default();
        config.admin_username = Some("admin".to_string());
        config.admin_password = Some("secret".to_string());
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("admin_password").is_none());
        assert!(json.get("max_dat_size").is_some());
    }
}
