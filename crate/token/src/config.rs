// Copyright 2024 Cosmian Tech SAS
// Licensed under the Business Source License version 1.1.

use std::{fmt, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{TokenError, TokenResult, TokenResultHelper};

const DEFAULT_LABEL: &str = "Cosmian soft token";
const DEFAULT_MANUFACTURER: &str = "Cosmian";
const DEFAULT_MODEL: &str = "soft token";
const DEFAULT_SERIAL: &str = "0000000000000001";
const DEFAULT_MAX_SESSIONS: usize = 64;
const DEFAULT_MIN_RSA_MODULUS_BITS: usize = 512;
const DEFAULT_MAX_RSA_MODULUS_BITS: usize = 16384;

/// Token description and policy, usually read from a TOML file:
///
/// ```toml
/// slot_id = 1
/// label = "test token"
/// user_pin = "1234"
/// max_sessions = 8
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    pub slot_id: u64,
    /// Token label, at most 32 bytes.
    pub label: String,
    pub manufacturer_id: String,
    pub model: String,
    pub serial_number: String,
    /// PIN of the normal user; empty by default.
    pub user_pin: Zeroizing<String>,
    /// PIN of the security officer; empty by default.
    pub so_pin: Zeroizing<String>,
    /// Upper bound on the sessions open at the same time on the slot.
    pub max_sessions: usize,
    pub min_rsa_modulus_bits: usize,
    pub max_rsa_modulus_bits: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            slot_id: 0,
            label: DEFAULT_LABEL.to_owned(),
            manufacturer_id: DEFAULT_MANUFACTURER.to_owned(),
            model: DEFAULT_MODEL.to_owned(),
            serial_number: DEFAULT_SERIAL.to_owned(),
            user_pin: Zeroizing::new(String::new()),
            so_pin: Zeroizing::new(String::new()),
            max_sessions: DEFAULT_MAX_SESSIONS,
            min_rsa_modulus_bits: DEFAULT_MIN_RSA_MODULUS_BITS,
            max_rsa_modulus_bits: DEFAULT_MAX_RSA_MODULUS_BITS,
        }
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("slot_id", &self.slot_id)
            .field("label", &self.label)
            .field("manufacturer_id", &self.manufacturer_id)
            .field("model", &self.model)
            .field("serial_number", &self.serial_number)
            .field("user_pin", &"****")
            .field("so_pin", &"****")
            .field("max_sessions", &self.max_sessions)
            .field(
                "rsa_modulus_bits",
                &(self.min_rsa_modulus_bits..=self.max_rsa_modulus_bits),
            )
            .finish()
    }
}

impl TokenConfig {
    pub fn from_toml_str(content: &str) -> TokenResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> TokenResult<Self> {
        let path = path.as_ref();
        debug!("loading token configuration from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(TokenError::from)
            .with_context(|| format!("cannot read the token configuration {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> TokenResult<()> {
        if self.label.len() > 32 {
            return Err(TokenError::Config(format!(
                "the label is {} bytes long, the maximum is 32",
                self.label.len()
            )));
        }
        if self.max_sessions == 0 {
            return Err(TokenError::Config(
                "max_sessions must be at least 1".to_owned(),
            ));
        }
        if self.min_rsa_modulus_bits < 512 || self.min_rsa_modulus_bits > self.max_rsa_modulus_bits
        {
            return Err(TokenError::Config(format!(
                "invalid RSA modulus range {}..={}",
                self.min_rsa_modulus_bits, self.max_rsa_modulus_bits
            )));
        }
        Ok(())
    }
}

#[expect(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = TokenConfig::default();
        config.validate().unwrap();
        assert!(config.user_pin.is_empty());
        assert_eq!(config.min_rsa_modulus_bits, 512);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
slot_id = 3
label = "test token"
user_pin = "1234"
max_sessions = 2
"#
        )
        .unwrap();
        let config = TokenConfig::load(file.path()).unwrap();
        assert_eq!(config.slot_id, 3);
        assert_eq!(config.label, "test token");
        assert_eq!(config.user_pin.as_str(), "1234");
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.max_rsa_modulus_bits, 16384);
        assert!(!format!("{config:?}").contains("1234"));
    }

    #[test]
    fn invalid_configurations() {
        for content in [
            "max_sessions = 0",
            "min_rsa_modulus_bits = 4096\nmax_rsa_modulus_bits = 2048",
            "label = \"a label which is definitely longer than thirty two bytes\"",
            "unknown_key = 1",
            "slot_id = \"one\"",
        ] {
            assert!(
                matches!(
                    TokenConfig::from_toml_str(content),
                    Err(TokenError::Config(_))
                ),
                "{content}"
            );
        }
        assert!(matches!(
            TokenConfig::load("/nonexistent/token.toml"),
            Err(TokenError::Context { .. })
        ));
    }
}
