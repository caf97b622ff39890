//! Broker configuration model and loader.
//!
//! The daemon loads one TOML file at startup describing the listener,
//! the compiler catalogue, the option switches compilers may opt into,
//! and the jail profiles that bound child processes:
//!
//! ```toml
//! [system]
//! listen_port = 2012
//! max_connections = 16
//! basedir = "/var/run/corral"
//! storedir = "/var/log/corral"
//!
//! [[compilers]]
//! name = "gcc-head"
//! compile_command = ["/usr/bin/g++", "prog.cc", "-o", "prog"]
//! run_command = ["./prog"]
//! version_command = ["/usr/bin/g++", "-dumpversion"]
//! output_file = "prog.cc"
//! switches = ["warning"]
//! jail = "default"
//!
//! [switches.warning]
//! flags = ["-Wall", "-Wextra"]
//!
//! [jails.default]
//! jail_command = ["/usr/bin/jailctl", "run", "--"]
//! compile_time_limit = "30s"
//! program_duration = "10s"
//! kill_wait = "5s"
//! output_limit_warn = 30000
//! output_limit_kill = 400000
//! ```
//!
//! The parsed snapshot is immutable for the daemon's lifetime and is
//! threaded through the session engine as a shared handle; nothing
//! mutates it after startup.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum size of a configuration file read, enforced before parsing.
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrokerConfig {
    /// Listener and filesystem settings.
    pub system: SystemConfig,

    /// Compiler catalogue, in display order.
    #[serde(default)]
    pub compilers: Vec<CompilerProfile>,

    /// Option switches referenced by compiler profiles.
    #[serde(default)]
    pub switches: HashMap<String, SwitchProfile>,

    /// Jail profiles referenced by compiler profiles.
    #[serde(default)]
    pub jails: HashMap<String, JailProfile>,
}

/// Listener and filesystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// TCP port the broker listens on.
    pub listen_port: u16,

    /// Maximum number of concurrently-active sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Parent directory of per-session workdirs; created 0700 at startup.
    pub basedir: PathBuf,

    /// Parent directory of archival run copies; created 0700 at startup.
    pub storedir: PathBuf,
}

const fn default_max_connections() -> usize {
    16
}

/// One compiler the broker can drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompilerProfile {
    /// Unique selection name, matched against `compiler=<name>`.
    pub name: String,

    /// Argv probing the compiler version; empty means "do not list".
    #[serde(default)]
    pub version_command: Vec<String>,

    /// Argv of the compile phase.
    pub compile_command: Vec<String>,

    /// Argv of the run phase.
    pub run_command: Vec<String>,

    /// Filename substituted for sources submitted without a name.
    #[serde(default)]
    pub output_file: String,

    /// Switch ids this compiler accepts, in splice order.
    #[serde(default)]
    pub switches: Vec<String>,

    /// Name of the jail profile bounding this compiler's children.
    pub jail: String,

    /// Whether the compiler appears in version listings.
    #[serde(default = "default_displayable")]
    pub displayable: bool,
}

const fn default_displayable() -> bool {
    true
}

/// An optional flag set clients can select per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchProfile {
    /// Argv elements spliced into the command.
    pub flags: Vec<String>,

    /// Splice index into the argv; 0 appends at the end.
    #[serde(default)]
    pub insert_position: usize,

    /// Splices into the run command instead of the compile command.
    #[serde(default)]
    pub runtime: bool,
}

/// Resource bounds applied to every child of a compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JailProfile {
    /// Argv prefix prepended to both phase commands; opaque to the core.
    #[serde(default)]
    pub jail_command: Vec<String>,

    /// Soft wall-clock limit of the compile phase.
    #[serde(with = "humantime_serde")]
    pub compile_time_limit: Duration,

    /// Soft wall-clock limit of the run phase.
    #[serde(with = "humantime_serde")]
    pub program_duration: Duration,

    /// Grace period between the soft signal and SIGKILL.
    #[serde(with = "humantime_serde")]
    pub kill_wait: Duration,

    /// Combined stdout+stderr bytes after which the child gets SIGXFSZ.
    pub output_limit_warn: u64,

    /// Combined stdout+stderr bytes after which the child gets SIGKILL.
    pub output_limit_kill: u64,
}

impl BrokerConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, exceeds
    /// [`MAX_CONFIG_FILE_SIZE`], fails to parse, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path).map_err(|e| ConfigError::Io {
            context: format!("open {}", path.display()),
            source: e,
        })?;
        let size = file
            .metadata()
            .map_err(|e| ConfigError::Io {
                context: "stat config file".to_string(),
                source: e,
            })?
            .len();
        if size > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::FileTooLarge {
                size,
                max: MAX_CONFIG_FILE_SIZE,
            });
        }

        let mut text = String::new();
        file.take(MAX_CONFIG_FILE_SIZE)
            .read_to_string(&mut text)
            .map_err(|e| ConfigError::Io {
                context: format!("read {}", path.display()),
                source: e,
            })?;

        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-references and bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.max_connections == 0 {
            return Err(ConfigError::invalid("system.max_connections must be at least 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for compiler in &self.compilers {
            if compiler.name.is_empty() {
                return Err(ConfigError::invalid("compiler with empty name"));
            }
            if !seen.insert(compiler.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate compiler name '{}'",
                    compiler.name
                )));
            }
            if compiler.compile_command.is_empty() || compiler.run_command.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "compiler '{}' has an empty compile or run command",
                    compiler.name
                )));
            }
            if !self.jails.contains_key(&compiler.jail) {
                return Err(ConfigError::invalid(format!(
                    "compiler '{}' references unknown jail '{}'",
                    compiler.name, compiler.jail
                )));
            }
            for switch in &compiler.switches {
                if !self.switches.contains_key(switch) {
                    return Err(ConfigError::invalid(format!(
                        "compiler '{}' references unknown switch '{switch}'",
                        compiler.name
                    )));
                }
            }
        }

        for (name, jail) in &self.jails {
            if jail.output_limit_warn > jail.output_limit_kill {
                return Err(ConfigError::invalid(format!(
                    "jail '{name}': output_limit_warn exceeds output_limit_kill"
                )));
            }
        }

        Ok(())
    }

    /// Looks up a compiler profile by selection name.
    #[must_use]
    pub fn compiler(&self, name: &str) -> Option<&CompilerProfile> {
        self.compilers.iter().find(|c| c.name == name)
    }

    /// Resolves the jail profile of a compiler.
    ///
    /// Always succeeds for a validated configuration.
    #[must_use]
    pub fn jail_for(&self, compiler: &CompilerProfile) -> Option<&JailProfile> {
        self.jails.get(&compiler.jail)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file exceeds the size cap.
    #[error("config file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// TOML parse failure.
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),

    /// A validation rule failed.
    #[error("invalid config: {message}")]
    Invalid {
        /// Description of the failed rule.
        message: String,
    },

    /// An I/O error while reading the file.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
