/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the RPC core.
//!
//! A [`Config`] can be built from defaults, environment variables or a YAML
//! file. The process-wide instance lives in [`global`].

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Request timeout, in seconds. Zero disables the timeout.
pub const RPC_TIMEOUT_SECS_ENV: &str = "MONARCH_RPC_TIMEOUT_SECS";
/// Whether pending remote references at shutdown are reported as an error.
pub const CHECK_RREF_LEAKS_ENV: &str = "MONARCH_RPC_CHECK_RREF_LEAKS";
/// Log filter directive, e.g. `debug` or `monarch_rpc=trace`.
pub const LOG_ENV: &str = "MONARCH_RPC_LOG";

/// Configuration for agents and registries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long an outstanding request may wait for its response. A zero
    /// duration waits forever.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Report remote references that are still pending at shutdown.
    pub check_rref_leaks: bool,
    /// Default log filter when [`LOG_ENV`] is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(60),
            check_rref_leaks: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables. Unset or unparseable
    /// variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup(RPC_TIMEOUT_SECS_ENV) {
            match val.parse::<u64>() {
                Ok(secs) => config.rpc_timeout = Duration::from_secs(secs),
                Err(err) => tracing::warn!("ignoring {}={:?}: {}", RPC_TIMEOUT_SECS_ENV, val, err),
            }
        }

        if let Some(val) = lookup(CHECK_RREF_LEAKS_ENV) {
            match val.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => config.check_rref_leaks = true,
                "0" | "false" | "no" => config.check_rref_leaks = false,
                _ => tracing::warn!("ignoring {}={:?}", CHECK_RREF_LEAKS_ENV, val),
            }
        }

        if let Some(val) = lookup(LOG_ENV) {
            if !val.is_empty() {
                config.log_level = val;
            }
        }

        config
    }

    /// Load configuration from a YAML file. Missing keys keep their
    /// defaults.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration. Values of `other` that differ from
    /// the defaults take precedence.
    pub fn merge(&mut self, other: &Self) {
        let defaults = Self::default();
        if other.rpc_timeout != defaults.rpc_timeout {
            self.rpc_timeout = other.rpc_timeout;
        }
        if other.check_rref_leaks != defaults.check_rref_leaks {
            self.check_rref_leaks = other.check_rref_leaks;
        }
        if other.log_level != defaults.log_level {
            self.log_level = other.log_level.clone();
        }
    }

    /// The request timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        (!self.rpc_timeout.is_zero()).then_some(self.rpc_timeout)
    }
}

/// The process-wide configuration.
///
/// Tests that change it must hold the lock returned by [`global::lock`]:
///
/// ```
/// # use std::time::Duration;
/// let config = monarch_rpc::config::global::lock();
/// let _guard = config.override_with(|c| c.rpc_timeout = Duration::from_millis(10));
/// assert_eq!(monarch_rpc::config::global::get().rpc_timeout, Duration::from_millis(10));
/// ```
pub mod global {
    use std::marker::PhantomData;
    use std::sync::Mutex;
    use std::sync::MutexGuard;

    use super::*;

    static CONFIG: LazyLock<Arc<RwLock<Config>>> =
        LazyLock::new(|| Arc::new(RwLock::new(Config::from_env())));

    /// Acquire the global configuration lock. Overrides can only be made
    /// through the returned [`ConfigLock`].
    pub fn lock() -> ConfigLock {
        static MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));
        ConfigLock {
            _guard: MUTEX.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// A snapshot of the global configuration.
    pub fn get() -> Config {
        CONFIG
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(config: Config) -> Config {
        let mut global = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *global, config)
    }

    /// Initialize the global configuration from environment variables.
    pub fn init_from_env() {
        set(Config::from_env());
    }

    /// Initialize the global configuration from a YAML file.
    pub fn init_from_yaml<P: AsRef<Path>>(path: P) -> Result<(), anyhow::Error> {
        set(Config::from_yaml(path)?);
        Ok(())
    }

    /// Reset the global configuration to defaults.
    pub fn reset_to_defaults() {
        set(Config::default());
    }

    /// Holds the global configuration lock.
    pub struct ConfigLock {
        _guard: MutexGuard<'static, ()>,
    }

    impl ConfigLock {
        /// Modify the global configuration until the returned guard is
        /// dropped.
        pub fn override_with(&self, f: impl FnOnce(&mut Config)) -> ConfigGuard<'_> {
            let mut config = get();
            f(&mut config);
            ConfigGuard {
                orig: Some(set(config)),
                _phantom: PhantomData,
            }
        }
    }

    /// Restores the previous global configuration when dropped.
    pub struct ConfigGuard<'a> {
        orig: Option<Config>,
        _phantom: PhantomData<&'a ()>,
    }

    impl Drop for ConfigGuard<'_> {
        fn drop(&mut self) {
            if let Some(orig) = self.orig.take() {
                set(orig);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(60));
        assert!(config.check_rref_leaks);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (RPC_TIMEOUT_SECS_ENV, "0"),
            (CHECK_RREF_LEAKS_ENV, "false"),
            (LOG_ENV, "debug"),
        ]);
        let config = Config::from_vars(|key| vars.get(key).map(ToString::to_string));
        assert_eq!(config.timeout(), None);
        assert!(!config.check_rref_leaks);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_from_vars_ignores_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (RPC_TIMEOUT_SECS_ENV, "soon"),
            (CHECK_RREF_LEAKS_ENV, "maybe"),
        ]);
        let config = Config::from_vars(|key| vars.get(key).map(ToString::to_string));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.yaml");

        std::fs::write(&path, "rpc_timeout: 5s\ncheck_rref_leaks: false\n").unwrap();
        let config = Config::from_yaml(&path).unwrap();
        assert_eq!(config.rpc_timeout, Duration::from_secs(5));
        assert!(!config.check_rref_leaks);
        assert_eq!(config.log_level, "info");

        let mut config = config;
        config.log_level = "warn".to_string();
        config.to_yaml(&path).unwrap();
        assert_eq!(Config::from_yaml(&path).unwrap(), config);

        assert!(Config::from_yaml(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_merge() {
        let mut config = Config::default();
        let other = Config {
            rpc_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        config.log_level = "debug".to_string();
        config.merge(&other);
        assert_eq!(config.rpc_timeout, Duration::from_secs(1));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_global_override() {
        let lock = global::lock();
        let before = global::get();
        {
            let _guard = lock.override_with(|config| config.check_rref_leaks = !before.check_rref_leaks);
            assert_eq!(global::get().check_rref_leaks, !before.check_rref_leaks);
        }
        assert_eq!(global::get(), before);
    }
}
