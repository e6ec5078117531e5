use crate::catalog::DeletePolicy;
use crate::error::ConfigError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

lazy_static! {
    static ref CONFIG: RwLock<Config> = RwLock::new(Config::default());
}

const CONFIG_PATH_VAR: &str = "SAVE_BACKUP_CONFIG_PATH";

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_location: PathBuf,
    pub data_location: PathBuf,
    pub local_username: String,
    pub delete_policy: DeletePolicy,
    pub verify_existing_blobs: bool,
    pub compression_level: i32,
    /// Worker threads for hashing and storing. 0 lets rayon decide.
    pub threads: usize,
    pub store_retries: u32,
}

impl Default for Config {
    fn default() -> Config {
        let data_location = Self::get_default_data_path();
        let db_location: PathBuf = [&data_location, &PathBuf::from("saves.db")]
            .iter()
            .collect();

        Config {
            db_location,
            data_location,
            local_username: "Default".to_string(),
            delete_policy: DeletePolicy::Soft,
            verify_existing_blobs: false,
            compression_level: 3,
            threads: 0,
            store_retries: 2,
        }
    }
}

impl Config {
    pub fn update(config: Config) {
        let mut w = CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *w = config;
    }

    pub fn static_config() -> RwLockReadGuard<'static, Config> {
        CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn clone_config() -> Config {
        Self::static_config().clone()
    }

    /// Root of the content addressed file store.
    pub fn store_location(&self) -> PathBuf {
        self.data_location.join("store")
    }

    fn get_default_data_path() -> PathBuf {
        match ProjectDirs::from("moe", "paoda", "save-backup") {
            Some(project) => project.data_dir().to_path_buf(),
            // No home directory, fall back to the working directory
            None => PathBuf::from(".save-backup"),
        }
    }
}

#[derive(Debug)]
pub struct ConfigManager {
    config_file_path: PathBuf,
}

impl Default for ConfigManager {
    fn default() -> Self {
        // Look in the environment variable, and if nothing
        // is there then we use directories-rs
        let config_file_path = match std::env::var(CONFIG_PATH_VAR) {
            Ok(env) => PathBuf::from(env),
            Err(_err) => ConfigManager::get_config_dir().join("settings.toml"),
        };

        ConfigManager { config_file_path }
    }
}

impl ConfigManager {
    /// Creates the config file with default values if it does not exist yet,
    /// otherwise loads it into the global config.
    pub fn new(path: PathBuf) -> Result<ConfigManager, ConfigError> {
        Self::create_config_directory(&path)?;

        Ok(ConfigManager {
            config_file_path: path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config_file_path
    }

    fn create_config_directory(path: &Path) -> Result<(), ConfigError> {
        let parent = path
            .parent()
            .ok_or_else(|| ConfigError::NoParent(path.to_path_buf()))?;

        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }

        Self::create_config_file(path)
    }

    fn create_config_file(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            let toml_string = toml::to_string(&Config::default())?;
            let mut file = File::create(path)?;
            file.write_all(toml_string.as_bytes())?;
            Ok(())
        } else {
            let file = File::open(path)?;
            Self::update_config_from_file(&file)
        }
    }

    fn update_config_from_file(file: &File) -> Result<(), ConfigError> {
        let mut buf_reader = BufReader::new(file);
        let mut toml_buf = vec![];
        buf_reader.read_to_end(&mut toml_buf)?;

        let config: Config = toml::from_slice(&toml_buf)?;
        Config::update(config);
        Ok(())
    }

    pub fn load_from_file(&self) -> Result<(), ConfigError> {
        let file = File::open(&self.config_file_path)?;
        Self::update_config_from_file(&file)
    }

    pub fn write_to_file(&self) -> Result<(), ConfigError> {
        let toml_string = toml::to_string(&Config::clone_config())?;
        let mut file = File::create(&self.config_file_path)?;

        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn get_config_dir() -> PathBuf {
        match ProjectDirs::from("moe", "paoda", "save-backup") {
            Some(project) => project.config_dir().to_path_buf(),
            None => PathBuf::from(".save-backup"),
        }
    }
}
