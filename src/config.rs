use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage::StorageFormat;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub session_id: String,
    pub storage_format: StorageFormat,
    pub worker_count: usize,
    pub worker_program: String,
    pub worker_memory_limit: u64,
    pub worker_timeout_seconds: f64,
    pub worker_startup_timeout_seconds: f64,
    pub maximum_rpc_errors: u32,
    pub maximum_restart_attempts: u32,
    pub status_interval_seconds: f64,
    pub queue_timeout_seconds: f64,
    pub queue_linger_seconds: f64,
    pub queue_buffer_size: usize,
    pub maximum_heap_size: usize,
    pub maximum_task_retries: u32,
    pub task_inactive_seconds: f64,
    pub merge_record_limit: usize,
    pub merge_record_ceiling: usize,
    pub enable_segfault_handler: bool,
    pub progress_interval_seconds: f64,
    pub log_json: bool,
}

impl Config {
    /// Worker count with the 0 = one-per-CPU default applied.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().max(1)
        } else {
            self.worker_count
        }
    }

    /// Queue settings shared by the foreman and worker ends of a channel.
    pub fn queue_config(&self, name: &str) -> crate::queue::QueueConfig {
        let mut queue = crate::queue::QueueConfig::new(name);
        queue.timeout_seconds = self.queue_timeout_seconds;
        queue.linger_seconds = self.queue_linger_seconds;
        queue.buffer_size = self.queue_buffer_size;
        queue
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    if config.session_id.trim().is_empty() {
        config.session_id = generate_session_id();
    }

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig {
        config,
        config_hash,
    })
}

/// Write the effective configuration into the session directory so worker
/// processes start from the exact settings the foreman resolved.
pub fn write_session_config(config: &Config, path: &Path) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

fn generate_session_id() -> String {
    let now = chrono::Utc::now();
    format!("{}_{}", now.format("%Y%m%dT%H%M%SZ"), rand_suffix())
}

fn rand_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{:08x}", nanos)
}
