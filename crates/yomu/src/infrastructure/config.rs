use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use yomu_source::fetch::RetryPolicy;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
        }
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(cfg: &FetchConfig) -> Self {
        RetryPolicy {
            timeout: Duration::from_secs(cfg.timeout_secs),
            max_attempts: cfg.max_attempts,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            rate_limit_multiplier: cfg.rate_limit_multiplier,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalFolder {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LocalFolders {
    Single(String),
    Multiple(Vec<LocalFolder>),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    #[serde(skip)]
    path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_create_database")]
    pub create_database: bool,
    #[serde(default = "default_download_path")]
    pub download_path: String,
    #[serde(default = "default_local_folders")]
    pub local_path: LocalFolders,
    /// seconds between library update passes, 0 disables periodic updates
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    #[serde(default)]
    pub update_at_startup: bool,
    #[serde(default)]
    pub auto_download_chapters: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_per_source_share")]
    pub per_source_share: f64,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default = "default_true")]
    pub prune_removed_chapters: bool,
    #[serde(default = "default_true")]
    pub refresh_metadata: bool,
    #[serde(default)]
    pub allow_nsfw: bool,
    #[serde(default)]
    pub resume_interrupted_downloads: bool,
    #[serde(default = "default_page_delay_max_ms")]
    pub page_delay_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: yomu_home().join("config.yml"),
            database_path: default_database_path(),
            create_database: default_create_database(),
            download_path: default_download_path(),
            local_path: default_local_folders(),
            update_interval: default_update_interval(),
            update_at_startup: false,
            auto_download_chapters: false,
            workers: default_workers(),
            per_source_share: default_per_source_share(),
            fetch: FetchConfig::default(),
            prune_removed_chapters: true,
            refresh_metadata: true,
            allow_nsfw: false,
            resume_interrupted_downloads: false,
            page_delay_max_ms: default_page_delay_max_ms(),
        }
    }
}

fn yomu_home() -> PathBuf {
    match std::env::var("YOMU_HOME") {
        Ok(path) => PathBuf::from(path),
        Err(_) => dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".yomu"),
    }
}

fn default_true() -> bool {
    true
}

fn default_update_interval() -> u64 {
    3600
}

fn default_workers() -> usize {
    4
}

fn default_per_source_share() -> f64 {
    0.5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_rate_limit_multiplier() -> u32 {
    4
}

fn default_page_delay_max_ms() -> u64 {
    1000
}

fn default_database_path() -> String {
    yomu_home().join("yomu.db").display().to_string()
}

fn default_create_database() -> bool {
    true
}

fn default_local_folders() -> LocalFolders {
    LocalFolders::Single(yomu_home().join("manga").display().to_string())
}

fn default_download_path() -> String {
    yomu_home().join("downloads").display().to_string()
}

impl Config {
    pub fn open<P: AsRef<Path>>(path: Option<P>) -> Result<Config, anyhow::Error> {
        let config_path = match path {
            Some(p) => PathBuf::new().join(p),
            None => yomu_home().join("config.yml"),
        };

        let cfg = match std::fs::File::open(&config_path) {
            Ok(file) => {
                info!("open config from {}", config_path.display());
                let mut cfg: Self = serde_yml::from_reader(file)?;
                cfg.path = config_path;
                cfg
            }
            Err(_) => {
                let cfg = Config {
                    path: config_path,
                    ..Default::default()
                };
                if let Some(parent) = cfg.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                cfg.save()?;
                info!("write default config at {}", cfg.path.display());
                cfg
            }
        };

        cfg.create_dirs()?;

        Ok(cfg)
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        std::fs::write(&self.path, serde_yml::to_string(&self)?)?;

        Ok(())
    }

    fn create_dirs(&self) -> Result<(), anyhow::Error> {
        std::fs::create_dir_all(&self.download_path)?;
        if let Some(parent) = Path::new(&self.database_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let LocalFolders::Single(path) = &self.local_path {
            std::fs::create_dir_all(path)?;
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.fetch)
    }

    pub fn page_delay_max(&self) -> Duration {
        Duration::from_millis(self.page_delay_max_ms)
    }

    /// Config rooted at `dir`, used by tests and one-off tools.
    pub fn with_home<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join("config.yml"),
            database_path: dir.join("yomu.db").display().to_string(),
            download_path: dir.join("downloads").display().to_string(),
            local_path: LocalFolders::Single(dir.join("manga").display().to_string()),
            ..Default::default()
        }
    }
}
