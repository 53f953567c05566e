// cmh-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use directories::UserDirs;
use semver::Version;
use tracing::debug;

use super::dependency::ParameterPrecedence;
use super::error::{CmhError, Result};

const CMH_HOME_DIRNAME: &str = ".cmakehub";
const STAGING_DIRNAME: &str = ".staging";
const DEFAULT_CACHE_MAX_ENTRIES: usize = 256;
const DEFAULT_MATERIALIZE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MAX_RESOLUTION_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub cmh_home: PathBuf,
    pub cache_dir: PathBuf,
    /// modules.json files, searched in order.
    pub registry_paths: Vec<PathBuf>,
    /// `None` disables the bound.
    pub cache_max_entries: Option<usize>,
    pub cache_max_bytes: Option<u64>,
    pub materialize_timeout: Duration,
    pub max_resolution_depth: usize,
    pub parameter_precedence: ParameterPrecedence,
    /// Re-hash artifact contents on every cache hit.
    pub verify_artifacts: bool,
    pub max_parallel: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading CMakeHub configuration");

        let cmh_home = match env::var_os("CMH_HOME").filter(|s| !s.is_empty()) {
            Some(home) => PathBuf::from(home),
            None => UserDirs::new()
                .map(|ud| ud.home_dir().join(CMH_HOME_DIRNAME))
                .ok_or_else(|| {
                    CmhError::Config(
                        "cannot determine the home directory; set CMH_HOME".to_string(),
                    )
                })?,
        };
        debug!("Effective CMH_HOME set to: {}", cmh_home.display());

        let mut config = Self::with_root(&cmh_home);

        if let Some(cache_dir) = env::var_os("CMH_CACHE_DIR").filter(|s| !s.is_empty()) {
            config.cache_dir = PathBuf::from(cache_dir);
        }
        if let Some(paths) = env::var_os("CMH_REGISTRY_PATH").filter(|s| !s.is_empty()) {
            config.registry_paths = env::split_paths(&paths).collect();
        }
        if let Some(max) = env_parse::<usize>("CMH_CACHE_MAX_ENTRIES")? {
            config.cache_max_entries = (max > 0).then_some(max);
        }
        if let Some(max) = env_parse::<u64>("CMH_CACHE_MAX_BYTES")? {
            config.cache_max_bytes = (max > 0).then_some(max);
        }
        if let Ok(raw) = env::var("CMH_MATERIALIZE_TIMEOUT") {
            config.materialize_timeout = humantime::parse_duration(raw.trim()).map_err(|e| {
                CmhError::Config(format!("CMH_MATERIALIZE_TIMEOUT='{raw}': {e}"))
            })?;
        }
        if let Some(depth) = env_parse::<usize>("CMH_MAX_RESOLUTION_DEPTH")? {
            config.max_resolution_depth = depth;
        }
        if let Some(precedence) = env_parse::<ParameterPrecedence>("CMH_PARAMETER_PRECEDENCE")? {
            config.parameter_precedence = precedence;
        }
        if let Some(verify) = env_flag("CMH_VERIFY_ARTIFACTS")? {
            config.verify_artifacts = verify;
        }
        if let Some(parallel) = env_parse::<usize>("CMH_MAX_PARALLEL")? {
            config.max_parallel = parallel.max(1);
        }

        debug!("Configuration loaded successfully: {:?}", config);
        Ok(config)
    }

    /// Defaults rooted at `root`, without consulting the environment.
    pub fn with_root(root: &Path) -> Self {
        Self {
            cmh_home: root.to_path_buf(),
            cache_dir: root.join("cache"),
            registry_paths: vec![root.join("modules.json")],
            cache_max_entries: Some(DEFAULT_CACHE_MAX_ENTRIES),
            cache_max_bytes: None,
            materialize_timeout: DEFAULT_MATERIALIZE_TIMEOUT,
            max_resolution_depth: DEFAULT_MAX_RESOLUTION_DEPTH,
            parameter_precedence: ParameterPrecedence::default(),
            verify_artifacts: false,
            max_parallel: default_parallelism(),
        }
    }

    pub fn cmh_home(&self) -> &Path {
        &self.cmh_home
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Scratch space for in-flight materializations, inside the cache so the
    /// final move is a same-filesystem rename.
    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir.join(STAGING_DIRNAME)
    }

    pub fn module_cache_dir(&self, module_name: &str) -> PathBuf {
        self.cache_dir.join(module_name)
    }

    pub fn module_version_cache_dir(&self, module_name: &str, version: &Version) -> PathBuf {
        self.module_cache_dir(module_name).join(version.to_string())
    }

    pub fn artifact_dir(&self, module_name: &str, version: &Version, fingerprint: &str) -> PathBuf {
        self.module_version_cache_dir(module_name, version)
            .join(fingerprint)
    }
}

fn default_parallelism() -> usize {
    std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(6)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CmhError::Config(format!("{key}='{raw}': {e}"))),
        _ => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(CmhError::Config(format!(
                "{key}='{raw}': expected one of 1/0, true/false, yes/no, on/off"
            ))),
        },
        _ => Ok(None),
    }
}
