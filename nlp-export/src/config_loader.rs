#[cfg(test)]
#[path = "../tests/unit/config_loader_test.rs"]
mod config_loader_test;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use crate::device::Device;
use crate::error::ExportError;
use crate::models::BertConfig;

/// Placeholder for a mandatory value that was left unset.
pub const MISSING: &str = "???";

fn is_missing(value: &str) -> bool {
    value.is_empty() || value == MISSING
}

/// Top-level intent/slot classification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSlotConfig {
    #[serde(default)]
    pub trainer: TrainerConfig,
    pub model: IntentSlotModelConfig,
}

/// Trainer options; only placement and precision influence export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub gpus: i64,
    pub num_nodes: u32,
    pub precision: u32,
    /// Distribution strategy, e.g. `ddp`.
    pub accelerator: Option<String>,
    pub max_epochs: u32,
    /// `-1` or unset means no step limit.
    pub max_steps: Option<i64>,
    pub accumulate_grad_batches: u32,
    pub gradient_clip_val: f32,
    pub log_every_n_steps: u32,
    pub val_check_interval: f32,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            gpus: 1,
            num_nodes: 1,
            precision: 32,
            accelerator: None,
            max_epochs: 50,
            max_steps: None,
            accumulate_grad_batches: 1,
            gradient_clip_val: 0.0,
            log_every_n_steps: 1,
            val_check_interval: 1.0,
        }
    }
}

/// Validated trainer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Trainer {
    config: TrainerConfig,
    device: Device,
}

impl Trainer {
    const SUPPORTED_PRECISIONS: [u32; 3] = [16, 32, 64];

    pub fn new(config: TrainerConfig) -> Result<Self> {
        if config.gpus < 0 {
            return Err(ExportError::invalid(format!("trainer.gpus must be non-negative, got {}", config.gpus)).into());
        }
        if config.num_nodes == 0 {
            return Err(ExportError::invalid("trainer.num_nodes must be at least 1").into());
        }
        let distributed = config.gpus > 1 || config.num_nodes > 1;
        if distributed && config.accelerator.is_none() {
            return Err(ExportError::invalid(format!(
                "trainer with {} gpus on {} nodes needs a distribution strategy in trainer.accelerator",
                config.gpus, config.num_nodes
            ))
            .into());
        }
        if !Self::SUPPORTED_PRECISIONS.contains(&config.precision) {
            return Err(ExportError::invalid(format!("trainer.precision must be one of 16, 32, 64, got {}", config.precision)).into());
        }

        let device = if config.gpus >= 1 { Device::Accelerator(0) } else { Device::Cpu };
        Ok(Self { config, device })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn precision(&self) -> u32 {
        self.config.precision
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }
}

/// Intent/slot model section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSlotModelConfig {
    /// Directory with `dict.intents.csv` and `dict.slots.csv`.
    pub data_dir: String,
    #[serde(default = "default_intent_loss_weight")]
    pub intent_loss_weight: f32,
    #[serde(default = "default_pad_label")]
    pub pad_label: i64,
    #[serde(default)]
    pub ignore_extra_tokens: bool,
    #[serde(default = "default_true")]
    pub ignore_start_end: bool,
    #[serde(default)]
    pub language_model: LanguageModelConfig,
    #[serde(default)]
    pub head: HeadConfig,
}

fn default_intent_loss_weight() -> f32 {
    0.6
}

fn default_pad_label() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

impl IntentSlotModelConfig {
    pub fn data_dir(&self) -> Result<&Path> {
        if is_missing(&self.data_dir) {
            return Err(ExportError::invalid("model.data_dir is mandatory and was not set").into());
        }
        Ok(Path::new(&self.data_dir))
    }
}

/// Pretrained encoder selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageModelConfig {
    pub max_seq_length: usize,
    pub pretrained_model_name: String,
    /// Directory with `.safetensors` weights.
    pub lm_checkpoint: Option<String>,
    /// HuggingFace `config.json` describing the encoder.
    pub config_file: Option<String>,
    /// Inline encoder configuration; wins over `config_file` and the built-in table.
    pub config: Option<BertConfig>,
}

impl Default for LanguageModelConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 50,
            pretrained_model_name: "bert-base-uncased".to_string(),
            lm_checkpoint: None,
            config_file: None,
            config: None,
        }
    }
}

impl LanguageModelConfig {
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.lm_checkpoint.as_deref().filter(|dir| !is_missing(dir)).map(Path::new)
    }

    /// Encoder architecture: inline config, then `config_file`, then the built-in table.
    pub fn resolve_encoder_config(&self) -> Result<BertConfig> {
        if let Some(config) = &self.config {
            info!("Using inline encoder configuration");
            return Ok(config.clone());
        }
        if let Some(config_file) = self.config_file.as_deref().filter(|file| !is_missing(file)) {
            return load_bert_config(Path::new(config_file));
        }
        BertConfig::builtin(&self.pretrained_model_name).ok_or_else(|| {
            ExportError::invalid(format!(
                "Unknown pretrained model '{}'; provide language_model.config or language_model.config_file",
                self.pretrained_model_name
            ))
            .into()
        })
    }
}

/// Joint classifier head section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadConfig {
    pub num_output_layers: usize,
    pub fc_dropout: f32,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self { num_output_layers: 2, fc_dropout: 0.1 }
    }
}

/// Serialization format of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yaml` and `.yml` files are YAML, everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref() {
            Some("yaml" | "yml") => Self::Yaml,
            _ => Self::Json,
        }
    }
}

/// Load the intent/slot configuration from a JSON or YAML file, chosen by extension.
pub fn load_config(config_path: &Path) -> Result<IntentSlotConfig> {
    let contents = read_to_string(config_path)?;
    let format = ConfigFormat::from_path(config_path);
    let config: IntentSlotConfig = match format {
        ConfigFormat::Json => serde_json::from_str::<IntentSlotConfig>(&contents).map_err(anyhow::Error::from),
        ConfigFormat::Yaml => serde_yaml::from_str::<IntentSlotConfig>(&contents).map_err(anyhow::Error::from),
    }
    .with_context(|| format!("Failed to parse {format:?} config at {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());
    Ok(config)
}

/// Load an encoder configuration from a HuggingFace `config.json`.
pub fn load_bert_config(config_path: &Path) -> Result<BertConfig> {
    let contents = read_to_string(config_path)?;
    let config: BertConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse encoder config at {}", config_path.display()))?;
    info!("Loaded encoder configuration from {}", config_path.display());
    Ok(config)
}

/// One label per non-empty line.
pub fn load_labels(labels_path: &Path) -> Result<Vec<String>> {
    let contents = read_to_string(labels_path)?;
    let labels: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    if labels.is_empty() {
        return Err(ExportError::invalid(format!("No labels found in {}", labels_path.display())).into());
    }
    Ok(labels)
}

/// Intent and slot label dictionaries of a data directory.
pub fn load_class_labels(data_dir: &Path) -> Result<(Vec<String>, Vec<String>)> {
    let intents = load_labels(&data_dir.join("dict.intents.csv"))?;
    let slots = load_labels(&data_dir.join("dict.slots.csv"))?;
    info!("Found {} intents and {} slots in {}", intents.len(), slots.len(), data_dir.display());
    Ok((intents, slots))
}

/// Download a configuration file into `dir`, named after the last URL segment.
///
/// A single blocking attempt; any network or HTTP error is returned as is.
pub fn fetch_config(url: &str, dir: &Path) -> Result<PathBuf> {
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Cannot derive a file name from {url}"))?;

    info!("🌐 Downloading {url}");
    let body = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .and_then(|response| response.bytes())
        .with_context(|| format!("Failed to download {url}"))?;

    let path = dir.join(file_name);
    std::fs::write(&path, &body).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("💾 Saved {} bytes to {}", body.len(), path.display());
    Ok(path)
}

fn read_to_string(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(contents)
}
