use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::arr::ArrKind;

fn default_mount_timeout() -> u64 {
    600
}

#[derive(Clone, Debug, Deserialize)]
pub struct DebridConfig {
    pub base_url: Url,
    /// Where the debrid filesystem is mounted. Polled, not notify-watched.
    pub watch_path: PathBuf,
    /// Seconds to keep waiting for a finished torrent to show up in the
    /// mount before giving up on it.
    #[serde(default = "default_mount_timeout")]
    pub mount_timeout: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ArrInstanceConfig {
    /// Unique instance name; also selects its API key from the secrets as
    /// `{NAME}_API_KEY` (uppercased).
    pub name: String,
    pub kind: ArrKind,
    pub base_url: Url,
    pub watch_path: PathBuf,
    pub processing_path: PathBuf,
    pub completed_path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub debrid: DebridConfig,
    #[serde(default)]
    pub instances: Vec<ArrInstanceConfig>,
}

const CONFIG_NAMES: [&str; 2] = ["blackhole.yml", "blackhole.yaml"];
const CONFIG_DIRS: [&str; 2] = ["/etc/blackhole", "."];

impl AppConfig {
    /// Loads `blackhole.{yml,yaml}` from `/etc/blackhole/` or the working
    /// directory, then applies environment overrides and validates.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let text = match path {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("error reading config file {path:?}"))?,
            None => find_config_file()?,
        };
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config: AppConfig =
            serde_yaml::from_str(text).context("error parsing config file")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.debrid.mount_timeout)
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(v) = std::env::var("DEBRID_URL") {
            self.debrid.base_url = v.parse().context("invalid DEBRID_URL")?;
        }
        if let Ok(v) = std::env::var("DEBRID_WATCH_PATH") {
            self.debrid.watch_path = v.into();
        }
        if let Ok(v) = std::env::var("DEBRID_MOUNT_TIMEOUT") {
            self.debrid.mount_timeout = v.parse().context("invalid DEBRID_MOUNT_TIMEOUT")?;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.instances.is_empty() {
            bail!("no media application instances configured");
        }
        if self.debrid.base_url.cannot_be_a_base() {
            bail!("debrid.base_url is not an http(s) URL");
        }
        let mut names = HashSet::new();
        for instance in &self.instances {
            if instance.base_url.cannot_be_a_base() {
                bail!("instance {}: base_url is not an http(s) URL", instance.name);
            }
            if !names.insert(instance.name.as_str()) {
                bail!("duplicate instance name {:?}", instance.name);
            }
        }
        Ok(())
    }
}

fn find_config_file() -> anyhow::Result<String> {
    for dir in CONFIG_DIRS {
        for name in CONFIG_NAMES {
            let path = Path::new(dir).join(name);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    debug!(path = ?path, "found config file");
                    return Ok(text);
                }
                Err(_) => continue,
            }
        }
    }
    bail!("no blackhole.yml found in /etc/blackhole or the working directory")
}

/// Flat key/value secrets: a `.env`-style file merged under the process
/// environment (the environment wins).
#[derive(Clone, Debug, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    pub fn load(env_file: Option<&Path>) -> Self {
        let mut values = HashMap::new();
        let path = env_file.unwrap_or(Path::new(".env"));
        if let Ok(text) = std::fs::read_to_string(path) {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    values.insert(
                        key.trim().to_owned(),
                        value.trim().trim_matches('"').to_owned(),
                    );
                }
            }
        }
        for (key, value) in std::env::vars() {
            values.insert(key, value);
        }
        Self { values }
    }

    pub fn from_map(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn debrid_api_key(&self) -> anyhow::Result<&str> {
        self.get("DEBRID_API_KEY").context("DEBRID_API_KEY is not set")
    }

    /// API key for a media-app instance, looked up as `{NAME}_API_KEY`.
    pub fn arr_api_key(&self, instance: &str) -> anyhow::Result<&str> {
        let key = format!("{}_API_KEY", instance.to_uppercase().replace('-', "_"));
        self.get(&key)
            .with_context(|| format!("{key} is not set for instance {instance:?}"))
    }
}
