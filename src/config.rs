use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::allocator::BlockStep;
use crate::error::{Error, Result};
use crate::models::cluster::{ClusterNode, NodeType};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    pub backend: BackendConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub wizards: WizardConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_task_log_interval_secs")]
    pub task_log_interval_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub cluster_list_interval_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub logs_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval_secs(),
            task_log_interval_secs: default_task_log_interval_secs(),
            cluster_list_interval_secs: default_status_interval_secs(),
            logs_interval_secs: default_status_interval_secs(),
        }
    }
}

impl PollingConfig {
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn task_log_interval(&self) -> Duration {
        Duration::from_secs(self.task_log_interval_secs)
    }

    pub fn cluster_list_interval(&self) -> Duration {
        Duration::from_secs(self.cluster_list_interval_secs)
    }

    pub fn logs_interval(&self) -> Duration {
        Duration::from_secs(self.logs_interval_secs)
    }
}

/// How long wizard sessions are kept without activity.
#[derive(Debug, Clone, Deserialize)]
pub struct WizardConfig {
    #[serde(default = "default_wizard_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Drafts and pending confirmations.
    #[serde(default = "default_wizard_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Sessions whose provisioning succeeded or failed.
    #[serde(default = "default_wizard_finished_grace_secs")]
    pub finished_grace_secs: u64,
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_wizard_sweep_interval_secs(),
            idle_timeout_secs: default_wizard_idle_timeout_secs(),
            finished_grace_secs: default_wizard_finished_grace_secs(),
        }
    }
}

impl WizardConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn finished_grace(&self) -> Duration {
        Duration::from_secs(self.finished_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_block_step")]
    pub block_step: u32,
    #[serde(default)]
    pub default_master: DefaultMasterDef,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            block_step: default_block_step(),
            default_master: DefaultMasterDef::default(),
        }
    }
}

impl AllocationConfig {
    pub fn block_step(&self) -> BlockStep {
        BlockStep(self.block_step)
    }
}

/// Node used when a wizard draft has no master to derive from.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultMasterDef {
    #[serde(default = "default_master_vm_id")]
    pub vm_id: u32,
    #[serde(default = "default_master_name")]
    pub name: String,
    #[serde(default = "default_master_cores")]
    pub cores: u16,
    #[serde(default = "default_master_memory")]
    pub memory: u32,
}

impl Default for DefaultMasterDef {
    fn default() -> Self {
        Self {
            vm_id: default_master_vm_id(),
            name: default_master_name(),
            cores: default_master_cores(),
            memory: default_master_memory(),
        }
    }
}

impl DefaultMasterDef {
    pub fn to_node(&self) -> ClusterNode {
        ClusterNode {
            vm_id: self.vm_id,
            name: self.name.clone(),
            cores: self.cores,
            memory: self.memory,
            ip_address: String::new(),
            storage_pool: String::new(),
            node_type: NodeType::Master,
            lock: None,
        }
    }
}

fn default_listen_port() -> u16 {
    9090
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_status_interval_secs() -> u64 {
    5
}

fn default_task_log_interval_secs() -> u64 {
    2
}

fn default_wizard_sweep_interval_secs() -> u64 {
    60
}

fn default_wizard_idle_timeout_secs() -> u64 {
    3600
}

fn default_wizard_finished_grace_secs() -> u64 {
    600
}

fn default_block_step() -> u32 {
    5
}

fn default_master_vm_id() -> u32 {
    999
}

fn default_master_name() -> String {
    "master-1".to_string()
}

fn default_master_cores() -> u16 {
    2
}

fn default_master_memory() -> u32 {
    2048
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("reading config {}: {}", path.display(), e)))?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data)
            .map_err(|e| Error::config(format!("parsing config: {}", e)))?;

        if cfg.backend.base_url.trim().is_empty() {
            return Err(Error::config("backend.base_url must be configured"));
        }

        let p = &cfg.polling;
        if [
            p.status_interval_secs,
            p.task_log_interval_secs,
            p.cluster_list_interval_secs,
            p.logs_interval_secs,
        ]
        .contains(&0)
        {
            return Err(Error::config("polling intervals must be at least one second"));
        }
        if cfg.wizards.sweep_interval_secs == 0 {
            return Err(Error::config("wizards.sweep_interval_secs must be at least one second"));
        }

        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }
}
