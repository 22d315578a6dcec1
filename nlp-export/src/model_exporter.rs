#[cfg(test)]
#[path = "../tests/unit/model_exporter_test.rs"]
mod model_exporter_test;

use anyhow::{Context, Result};
use log::{debug, info};
use prost::Message;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::checker;
use crate::device::Device;
use crate::error::ExportError;
use crate::models::Exportable;
use crate::onnx::{IR_VERSION, ModelProto, OPSET_VERSION, OperatorSetIdProto, StringStringEntryProto};
use crate::tracer::GraphTracer;

/// What an export produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub node_count: usize,
    pub initializer_count: usize,
    pub parameter_count: usize,
    pub bytes_written: usize,
}

/// Traces exportable modules and writes them as ONNX models.
#[derive(Debug, Clone)]
pub struct OnnxExporter {
    device: Option<Device>,
    check: bool,
}

impl Default for OnnxExporter {
    fn default() -> Self {
        Self { device: None, check: true }
    }
}

impl OnnxExporter {
    pub const PRODUCER_NAME: &'static str = "nlp-export";
    const EXPORT_PRECISION: u32 = 32;

    pub fn new() -> Self {
        Self::default()
    }

    /// Require every parameter to live on `device`.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Enable or disable the full graph check run before writing.
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Trace `model` into an in-memory ONNX model.
    pub fn trace<M: Exportable + ?Sized>(&self, model: &M) -> Result<ModelProto> {
        let precision = model.precision_bits();
        if precision != Self::EXPORT_PRECISION {
            return Err(ExportError::UnsupportedPrecision(precision).into());
        }

        let device = model.device()?;
        if let Some(expected) = self.device.filter(|expected| *expected != device) {
            let name = model.parameters().first().map(|param| param.name.clone()).unwrap_or_default();
            return Err(ExportError::DeviceMismatch { name, expected, actual: device }.into());
        }

        let class_name = model.class_name();
        let mut tracer = GraphTracer::new(class_name, device);
        let inputs = model
            .input_types()
            .into_iter()
            .map(|(name, ty)| tracer.input(name, ty.elem, ty.dims))
            .collect::<Result<Vec<_>>>()?;

        let outputs = model.forward(&mut tracer, &inputs)?;
        let output_names = model.output_names();
        if outputs.len() != output_names.len() {
            anyhow::bail!("{class_name} produced {} outputs, declared {}", outputs.len(), output_names.len());
        }
        let named_outputs: Vec<(&str, _)> = output_names.into_iter().zip(outputs).collect();
        let graph = tracer.finish(&named_outputs)?;
        debug!("Traced {class_name}: {} nodes, {} initializers", graph.node.len(), graph.initializer.len());

        Ok(ModelProto {
            ir_version: IR_VERSION,
            producer_name: Self::PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto { domain: String::new(), version: OPSET_VERSION }],
            metadata_props: vec![
                StringStringEntryProto { key: "class_name".to_string(), value: class_name.to_string() },
                StringStringEntryProto { key: "device".to_string(), value: device.to_string() },
            ],
            ..Default::default()
        })
    }

    /// Trace `model`, check the graph and write it to `output`.
    pub fn export<M: Exportable + ?Sized>(&self, model: &M, output: &Path) -> Result<ExportSummary> {
        let parent = output.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
        if !parent.is_dir() {
            return Err(ExportError::MissingOutputDir(parent.to_path_buf()).into());
        }

        info!("🧮 Exporting {} to {}", model.class_name(), output.display());
        let onnx_model = self.trace(model)?;
        if self.check {
            checker::check_model(&onnx_model, true)?;
        }

        let bytes = onnx_model.encode_to_vec();
        let file = File::create(output).with_context(|| format!("Failed to create {}", output.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;

        let graph = onnx_model.graph.as_ref();
        let summary = ExportSummary {
            path: output.to_path_buf(),
            node_count: graph.map_or(0, |graph| graph.node.len()),
            initializer_count: graph.map_or(0, |graph| graph.initializer.len()),
            parameter_count: model.num_parameters(),
            bytes_written: bytes.len(),
        };
        info!(
            "💾 Written {} nodes, {} initializers ({} bytes) to {}",
            summary.node_count,
            summary.initializer_count,
            summary.bytes_written,
            output.display()
        );
        Ok(summary)
    }
}

/// Read an ONNX model from disk.
pub fn load_model(path: &Path) -> Result<ModelProto> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    ModelProto::decode(bytes.as_slice()).with_context(|| format!("Failed to decode ONNX model {}", path.display()))
}
