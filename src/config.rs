//! Process-wide configuration.
//!
//! Built once at startup and passed by reference into the repository
//! client and the sandboxed executor; there is no ambient global state.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Listing endpoint of the artifact store. Override with `LAB_BISECT_STORE`.
pub const DEFAULT_STORE_URL: &str = "https://www.googleapis.com/storage/v1";

/// Bucket holding the published builds. Override with `LAB_BISECT_BUCKET`.
pub const DEFAULT_BUCKET: &str = "llvm-build-artifacts";

#[derive(Clone, Debug)]
pub struct Config {
    /// Per-user state directory (`~/.lab-bisect` unless `LAB_BISECT_HOME`
    /// is set): the builder catalog, the optional build cache, and
    /// `config.json` live here.
    pub data_dir: PathBuf,
    pub store_url: String,
    pub bucket: String,
    /// Keep a copy of every downloaded archive under the build cache.
    pub cache_builds: bool,
    /// Never talk to the store; list builders and builds from the local
    /// build cache only.
    pub only_use_cache: bool,
}

/// Optional on-disk settings, `<data_dir>/config.json`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cache_builds: bool,
    #[serde(default)]
    only_use_cache: bool,
}

fn env_flag(name: &str) -> bool {
    env::var(name).map(|v| !v.is_empty()).unwrap_or(false)
}

impl Config {
    pub fn load() -> anyhow::Result<Config> {
        let data_dir = match env::var_os("LAB_BISECT_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let mut home = home::home_dir().context("could not find home directory")?;
                home.push(".lab-bisect");
                home
            }
        };

        let config_path = data_dir.join("config.json");
        let file = if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .with_context(|| format!("could not read {}", config_path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("malformed config file {}", config_path.display()))?
        } else {
            ConfigFile::default()
        };

        Ok(Config {
            data_dir,
            store_url: env::var("LAB_BISECT_STORE").unwrap_or_else(|_| DEFAULT_STORE_URL.into()),
            bucket: env::var("LAB_BISECT_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.into()),
            cache_builds: file.cache_builds || env_flag("LAB_BISECT_CACHE_BUILDS"),
            only_use_cache: file.only_use_cache || env_flag("LAB_BISECT_ONLY_USE_CACHE"),
        })
    }

    pub fn ci_dir(&self) -> PathBuf {
        self.data_dir.join("ci")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.ci_dir().join("builder_catalog.json")
    }

    pub fn build_cache_dir(&self) -> PathBuf {
        self.ci_dir().join("build_cache")
    }
}
