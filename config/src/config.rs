use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Settings for the spynode binary. Every field has a default so a partial
/// config file is fine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// host:port of the untrusted peer
    pub node_address: String,
    pub user_agent: String,
    /// hex hash of the block at height 0 of the local header chain
    pub genesis_hash: String,

    pub connect_timeout_secs: u64,
    /// peer must send its version within this window after connecting
    pub handshake_timeout_secs: u64,
    /// peer must answer the header request within this window
    pub verify_timeout_secs: u64,
    pub timeout_check_interval_secs: u64,
    pub tx_request_timeout_secs: u64,
    pub max_tx_request_attempts: u32,

    pub header_delta: u64,
    pub header_count: usize,
    pub max_frame_length: usize,
    pub reconnect_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_address: "127.0.0.1:8333".to_string(),
            user_agent: "/spynode:0.1.0/".to_string(),
            genesis_hash: "0".repeat(64),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 15,
            verify_timeout_secs: 15,
            timeout_check_interval_secs: 10,
            tx_request_timeout_secs: 30,
            max_tx_request_attempts: 5,
            header_delta: 6,
            header_count: 10,
            max_frame_length: 32 * 1024 * 1024,
            reconnect_delay_secs: 30,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".spynode")
            .join("config.json")
    }

    /// Loads the config from the default location, falling back to defaults
    /// if the file is missing or unreadable.
    pub fn load() -> Self {
        Self::load_or_default(&Self::default_path())
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load_from(&path.to_string_lossy()) {
            Ok(cfg) => cfg,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("Ignoring config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &str) -> io::Result<Self> {
        let expanded = shellexpand::tilde(path);
        let data = fs::read_to_string(expanded.as_ref())?;
        Ok(Self::from_json(&data)?)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    pub fn to_pretty_json(&self) -> String {
        // plain struct of strings and integers
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_pretty_json())
    }

    /// Writes a default config file unless one already exists.
    pub fn init_default() -> io::Result<PathBuf> {
        let path = Self::default_path();
        if !path.exists() {
            Self::default().save_to(&path)?;
        }
        Ok(path)
    }

    pub fn view(&self) {
        println!("{}", self.to_pretty_json());
    }

    /// Sets a single field by its JSON key. Values are parsed as JSON first
    /// and fall back to a plain string.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), String> {
        let mut doc = serde_json::to_value(&*self).map_err(|e| e.to_string())?;
        let fields = doc
            .as_object_mut()
            .ok_or_else(|| "config is not an object".to_string())?;
        if !fields.contains_key(key) {
            return Err(format!("unknown config key: {}", key));
        }

        let parsed = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        fields.insert(key.to_string(), parsed);

        *self = serde_json::from_value(doc).map_err(|e| format!("invalid value for {}: {}", key, e))?;
        Ok(())
    }
}

/// Command line overrides applied on top of the loaded file.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Peer to connect to (host:port)
    #[arg(long = "peer")]
    pub node_address: Option<String>,

    #[arg(long)]
    pub user_agent: Option<String>,

    /// Hex hash of the local genesis header
    #[arg(long)]
    pub genesis_hash: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(addr) = &self.node_address {
            cfg.node_address = addr.clone();
        }
        if let Some(agent) = &self.user_agent {
            cfg.user_agent = agent.clone();
        }
        if let Some(hash) = &self.genesis_hash {
            cfg.genesis_hash = hash.clone();
        }
    }
}
