//! # nlp-export
//!
//! Export NLP classifier heads and a BERT-based intent/slot classification model to ONNX,
//! then verify the exported graphs.
//!
//! Modules describe their inference-mode forward pass to a [`GraphTracer`], which records a
//! deterministic, named node list. [`OnnxExporter`] turns the trace into an ONNX model,
//! checks it and writes it; [`GraphManifest`] pins the structure of an exported graph.
//!
//! ## Examples
//!
//! ### Exporting a classifier head
//!
//! ```rust,no_run
//! use nlp_export::{ClassifierConfig, Device, Exportable, Module, TokenClassifier};
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClassifierConfig { hidden_size: 256, num_classes: 16, num_layers: 1, ..Default::default() };
//! let head = TokenClassifier::new(config)?.to(Device::Accelerator(0));
//! head.export(Path::new("TokenClassifier.onnx"))?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Exporting the intent/slot model
//!
//! ```rust,no_run
//! use nlp_export::export_intent_slot_model;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! export_intent_slot_model(Path::new("intent_slot_classification_config.yaml"), None, Path::new("model.onnx"))?;
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod config_loader;
pub mod device;
pub mod error;
pub mod model_exporter;
pub mod models;
pub mod onnx;
pub mod shape_inference;
pub mod snapshot;
pub mod tensor;
pub mod tensor_reader;
pub mod tracer;

pub use checker::check_model;
pub use config_loader::{ConfigFormat, IntentSlotConfig, IntentSlotModelConfig, Trainer, TrainerConfig, fetch_config, load_config};
pub use device::Device;
pub use error::ExportError;
pub use model_exporter::{ExportSummary, OnnxExporter, load_model};
pub use models::{
    BertConfig, BertEncoder, BertPretrainingTokenClassifier, ClassifierConfig, Exportable, HeadKind,
    IntentSlotClassificationModel, Module, SequenceClassifier, SequenceRegression, SequenceTokenClassifier,
    SequenceTokenClassifierConfig, TokenClassifier, build_head,
};
pub use snapshot::{GraphManifest, SnapshotMismatch, bless_or_verify};
pub use tensor::{Parameter, ParameterInit};
pub use tracer::{GraphTracer, Value};

use anyhow::Result;
use log::info;
use std::path::Path;

/// Build the intent/slot model described by a JSON or YAML config and export it to `output`.
///
/// `data_dir` overrides `model.data_dir` of the config. The exported file is reloaded and
/// checked before returning.
pub fn export_intent_slot_model(config_path: &Path, data_dir: Option<&Path>, output: &Path) -> Result<ExportSummary> {
    info!("🚀 Starting intent/slot model export...");

    let mut config = load_config(config_path)?;
    if let Some(data_dir) = data_dir {
        config.model.data_dir = data_dir.display().to_string();
    }

    let trainer = Trainer::new(config.trainer.clone())?;
    let model = IntentSlotClassificationModel::new(&config.model, &trainer)?;
    let summary = OnnxExporter::new().with_device(trainer.device()).export(&model, output)?;

    info!("🔍 Checking exported model...");
    check_model(&load_model(output)?, true)?;

    info!("✅ Export finished successfully!");
    Ok(summary)
}
