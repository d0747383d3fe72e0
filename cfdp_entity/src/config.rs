//Command line interface + entity configuration file
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cfdp_protocol::{ChecksumType, EntityId, TransmissionMode};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::filestore::ConflictPolicy;
use crate::manager::{DEFAULT_MAX_FILE_SIZE, DEFAULT_RETENTION};
use crate::registry::{EntityConfig, EntityRegistry, RegistryError};

const DEFAULT_BIND: &str = "0.0.0.0:7900";

fn default_class() -> TransmissionMode {
    TransmissionMode::Acknowledged
}
fn default_true() -> bool {
    true
}
fn default_segment_size() -> usize {
    1024
}
fn default_ack_timeout_ms() -> u64 {
    2_000
}
fn default_max_retries() -> u32 {
    4
}
fn default_inactivity_timeout_ms() -> u64 {
    30_000
}
fn default_store_dir() -> PathBuf {
    PathBuf::from("received")
}
fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}
fn default_retention_ms() -> u64 {
    DEFAULT_RETENTION.as_millis() as u64
}

/// One `[local]` or `[[remotes]]` table. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEntry {
    pub id: u32,
    /// Bind address for the local entity, peer address for a remote one.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_class")]
    pub default_class: TransmissionMode,
    #[serde(default = "default_true")]
    pub closure_requested: bool,
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    #[serde(default)]
    pub checksum: ChecksumType,
    #[serde(default)]
    pub crc: bool,
}

impl EntityEntry {
    pub fn to_config(&self, is_local: bool) -> EntityConfig {
        EntityConfig {
            entity_id: EntityId(self.id),
            is_local,
            default_class: self.default_class,
            closure_requested_default: self.closure_requested,
            segment_size: self.segment_size,
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            max_retries: self.max_retries,
            inactivity_timeout: Duration::from_millis(self.inactivity_timeout_ms),
            checksum_type: self.checksum,
            crc: self.crc,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub conflict: ConflictPolicy,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
            conflict: ConflictPolicy::default(),
            max_file_size: default_max_file_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self { retention_ms: default_retention_ms() }
    }
}

/// Contents of the entity TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFile {
    pub local: EntityEntry,
    #[serde(default)]
    pub remotes: Vec<EntityEntry>,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub engine: EngineSection,
}

impl EntityFile {
    /// Reads `path` and applies `CFDP_`-prefixed environment overrides,
    /// e.g. `CFDP_STORE__DIR=/data/in` or `CFDP_LOCAL__SEGMENT_SIZE=512`.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .add_source(
                ::config::Environment::with_prefix("CFDP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("reading {}", path.display()))?;
        settings
            .try_deserialize()
            .with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn registry(&self) -> Result<EntityRegistry, RegistryError> {
        let mut registry = EntityRegistry::new();
        registry.register(self.local.to_config(true))?;
        for remote in &self.remotes {
            registry.register(remote.to_config(false))?;
        }
        Ok(registry)
    }

    /// UDP address of every remote that has one.
    pub fn peer_addresses(&self) -> Result<HashMap<EntityId, SocketAddr>> {
        self.remotes
            .iter()
            .filter_map(|r| r.address.as_ref().map(|a| (r.id, a)))
            .map(|(id, addr)| {
                let parsed = addr
                    .parse()
                    .with_context(|| format!("remote {id}: bad address {addr:?}"))?;
                Ok((EntityId(id), parsed))
            })
            .collect()
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.engine.retention_ms)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub file: EntityFile,
    pub bind: String,
    pub store_dir: PathBuf,
    pub tick: Duration,
    /// Probability of dropping each outbound datagram.
    pub loss: f64,
    pub log_dir: Option<PathBuf>,
    pub send: Vec<PathBuf>,
    pub send_to: Option<EntityId>,
    pub class: Option<TransmissionMode>,
    pub closure: Option<bool>,
    pub exit_when_idle: bool,
    pub print_config: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "cfdp-entity", about = "CFDP file transfer entity over UDP")]
pub struct Cli {
    #[arg(long, default_value = "cfdp.toml")]     pub config: PathBuf,
    /// Overrides `local.address` from the config file.
    #[arg(long)]                                   pub bind: Option<String>,
    /// Overrides `store.dir` from the config file.
    #[arg(long)]                                   pub store_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 50)]            pub tick_ms: u64,
    /// Simulated outbound loss, 0.0..=1.0.
    #[arg(long, default_value_t = 0.0)]           pub loss: f64,
    #[arg(long)]                                   pub log_dir: Option<PathBuf>,
    /// File to send at startup; repeatable.
    #[arg(long)]                                   pub send: Vec<PathBuf>,
    /// Destination entity for `--send`.
    #[arg(long)]                                   pub to: Option<u32>,
    /// Transfer class 1 or 2; defaults to the peer's configuration.
    #[arg(long)]                                   pub class: Option<u8>,
    #[arg(long)]                                   pub closure: Option<bool>,
    /// Exit after the first finished transfer once nothing is active.
    #[arg(long, default_value_t = false)]         pub exit_when_idle: bool,
    /// Print the effective configuration as TOML and exit.
    #[arg(long, default_value_t = false)]         pub print_config: bool,
}

impl Cli {
    pub fn parse_and_build_config() -> Result<Config> {
        let c = <Cli as Parser>::parse();
        c.into_config()
    }

    pub fn into_config(self) -> Result<Config> {
        let mut file = EntityFile::load(&self.config)?;
        self.apply(&mut file)
    }

    /// Merges command-line overrides into an already loaded file.
    pub fn apply(self, file: &mut EntityFile) -> Result<Config> {
        if !(0.0..=1.0).contains(&self.loss) {
            bail!("--loss must be within 0.0..=1.0, got {}", self.loss);
        }
        if self.tick_ms == 0 {
            bail!("--tick-ms must be non-zero");
        }
        let class = self
            .class
            .map(TransmissionMode::try_from)
            .transpose()
            .map_err(anyhow::Error::msg)?;

        let send_to = match (self.to, self.send.is_empty()) {
            (Some(id), _) => Some(EntityId(id)),
            (None, true) => None,
            (None, false) if file.remotes.len() == 1 => Some(EntityId(file.remotes[0].id)),
            (None, false) => bail!("--send needs --to when more than one remote is configured"),
        };

        if let Some(bind) = &self.bind {
            file.local.address = Some(bind.clone());
        }
        if let Some(dir) = &self.store_dir {
            file.store.dir = dir.clone();
        }
        let bind = file.local.address.clone().unwrap_or_else(|| DEFAULT_BIND.to_string());

        Ok(Config {
            file: file.clone(),
            bind,
            store_dir: file.store.dir.clone(),
            tick: Duration::from_millis(self.tick_ms),
            loss: self.loss,
            log_dir: self.log_dir,
            send: self.send,
            send_to,
            class,
            closure: self.closure,
            exit_when_idle: self.exit_when_idle,
            print_config: self.print_config,
        })
    }
}
