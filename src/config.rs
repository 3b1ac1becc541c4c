// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Runtime configuration.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Environment variable selecting the condition variable emulation policy.
pub const CONDVAR_EMULATION_ENV: &str = "SHMSYNC_CONDVAR_EMULATION";

/// Whether process-shared condition variables use the native
/// `pthread_cond_t` or the semaphore-based emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmulationPolicy {
    /// Emulate where native process-shared condition variables are not
    /// dependable (macOS), or everywhere with the `condvar-emulation` feature.
    #[default]
    Auto,
    Always,
    Never,
}

impl EmulationPolicy {
    /// Resolve the policy for this build and platform.
    pub fn emulate(self) -> bool {
        match self {
            EmulationPolicy::Auto => {
                cfg!(target_os = "macos") || cfg!(feature = "condvar-emulation")
            }
            EmulationPolicy::Always => true,
            EmulationPolicy::Never => false,
        }
    }
}

impl FromStr for EmulationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(EmulationPolicy::Auto),
            "always" | "on" | "1" => Ok(EmulationPolicy::Always),
            "never" | "off" | "0" => Ok(EmulationPolicy::Never),
            _ => Err(ConfigError::InvalidValue {
                var: CONDVAR_EMULATION_ENV,
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for EmulationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmulationPolicy::Auto => "auto",
            EmulationPolicy::Always => "always",
            EmulationPolicy::Never => "never",
        })
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var} (expected auto, always or never)")]
    InvalidValue { var: &'static str, value: String },
}

/// Settings applied when a [`SharedPart`](crate::SharedPart) is initialised.
///
/// The resolved choice is recorded in the shared part itself, so processes
/// that attach later follow the initialiser whatever their own settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncConfig {
    pub condvar_emulation: EmulationPolicy,
}

impl SyncConfig {
    pub fn with_emulation(policy: EmulationPolicy) -> Self {
        Self {
            condvar_emulation: policy,
        }
    }

    /// Read [`CONDVAR_EMULATION_ENV`]; unset means the default.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONDVAR_EMULATION_ENV) {
            Ok(v) => {
                let policy = v.parse()?;
                tracing::debug!(target: "shmsync::config", %policy, "condvar emulation from environment");
                Ok(Self::with_emulation(policy))
            }
            Err(_) => Ok(Self::default()),
        }
    }

    /// Like [`SyncConfig::try_from_env`], falling back to the default on an
    /// invalid value.
    pub fn from_env() -> Self {
        Self::try_from_env().unwrap_or_else(|e| {
            tracing::warn!(target: "shmsync::config", error = %e, "ignoring invalid configuration");
            Self::default()
        })
    }
}
