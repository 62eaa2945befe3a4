//! Process configuration

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{ProcessError, Result};

/// Configuration for one external program invocation
///
/// Can be built in code or loaded from TOML:
///
/// ```toml
/// program = "arduino-cli"
/// args = ["compile", "--fqbn", "arduino:avr:uno"]
/// working_dir = "sketches/blink"
///
/// [env]
/// ARDUINO_DIRECTORIES_DATA = "/opt/arduino"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Executable name or path
    pub program: String,
    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory (None = current dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Environment variables (added to parent env unless `clear_env`)
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of the parent's
    #[serde(default)]
    pub clear_env: bool,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            working_dir: None,
            env: BTreeMap::new(),
            clear_env: false,
        }
    }

    /// Load a configuration from a TOML document and validate it
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| ProcessError::InvalidConfig(format!("malformed TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Replace the whole environment with `vars`
    pub fn replace_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.clear_env = true;
        self
    }

    /// Check the configuration can describe a real invocation
    pub fn validate(&self) -> Result<()> {
        if self.program.trim().is_empty() {
            return Err(ProcessError::InvalidConfig(
                "program name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Full command line, program first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Build the tokio command; stdio and process-group setup are left to the caller
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        if self.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&self.env);

        cmd
    }
}
