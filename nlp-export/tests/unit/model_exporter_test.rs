use super::*;
use crate::models::{ClassifierConfig, Module, SequenceClassifier, TokenClassifier};
use crate::tensor::{Parameter, TensorType};
use crate::tracer::Value;
use tempfile::TempDir;

fn token_classifier() -> TokenClassifier {
    TokenClassifier::new(TokenClassifier::default_config(16, 4)).unwrap()
}

fn export_error(err: &anyhow::Error) -> &ExportError {
    err.downcast_ref::<ExportError>().unwrap_or_else(|| panic!("expected ExportError, got {err:?}"))
}

struct HalfPrecision(TokenClassifier);

impl Module for HalfPrecision {
    fn parameters(&self) -> Vec<&Parameter> {
        self.0.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.0.parameters_mut()
    }
}

impl Exportable for HalfPrecision {
    fn class_name(&self) -> &'static str {
        "HalfPrecision"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        self.0.input_types()
    }

    fn output_names(&self) -> Vec<&'static str> {
        self.0.output_names()
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        self.0.forward(t, inputs)
    }

    fn precision_bits(&self) -> u32 {
        16
    }
}

#[test]
fn test_export_writes_loadable_model() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("TokenClassifier.onnx");
    let head = token_classifier();

    let summary = head.export(&path).unwrap();
    assert!(path.exists());
    assert_eq!(summary.path, path);
    assert_eq!(summary.node_count, 3);
    assert_eq!(summary.initializer_count, 2);
    assert_eq!(summary.parameter_count, 16 * 4 + 4);
    assert_eq!(summary.bytes_written as u64, std::fs::metadata(&path).unwrap().len());

    let model = load_model(&path).unwrap();
    assert_eq!(model, OnnxExporter::new().trace(&head).unwrap());
    checker::check_model(&model, true).unwrap();
}

#[test]
fn test_model_metadata() {
    let head = token_classifier().to(Device::Accelerator(0));
    let model = OnnxExporter::new().trace(&head).unwrap();

    assert_eq!(model.ir_version, IR_VERSION);
    assert_eq!(model.producer_name, "nlp-export");
    assert_eq!(model.opset_import, [OperatorSetIdProto { domain: String::new(), version: 11 }]);
    assert_eq!(model.graph.as_ref().map(|g| g.name.as_str()), Some("TokenClassifier"));
    let device = model.metadata_props.iter().find(|p| p.key == "device").map(|p| p.value.as_str());
    assert_eq!(device, Some("accelerator:0"));
}

#[test]
fn test_export_is_byte_identical_across_runs() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.onnx");
    let second = dir.path().join("second.onnx");

    let config = ClassifierConfig { hidden_size: 16, num_classes: 4, ..Default::default() };
    SequenceClassifier::new(config.clone()).unwrap().export(&first).unwrap();
    SequenceClassifier::new(config).unwrap().export(&second).unwrap();

    assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
}

#[test]
fn test_missing_output_dir() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("does/not/exist");
    let err = token_classifier().export(&missing.join("model.onnx")).unwrap_err();
    assert!(matches!(export_error(&err), ExportError::MissingOutputDir(path) if *path == missing));
}

#[test]
fn test_requested_device_must_match() {
    let dir = TempDir::new().unwrap();
    let exporter = OnnxExporter::new().with_device(Device::Accelerator(0));
    let err = exporter.export(&token_classifier(), &dir.path().join("model.onnx")).unwrap_err();

    match export_error(&err) {
        ExportError::DeviceMismatch { expected, actual, .. } => {
            assert_eq!(*expected, Device::Accelerator(0));
            assert_eq!(*actual, Device::Cpu);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!dir.path().join("model.onnx").exists());
}

#[test]
fn test_mixed_devices_are_rejected() {
    let mut head = token_classifier();
    head.parameters_mut()[1].device = Device::Accelerator(1);

    let err = OnnxExporter::new().trace(&head).unwrap_err();
    match export_error(&err) {
        ExportError::DeviceMismatch { name, actual, .. } => {
            assert_eq!(name, "mlp.layer0.bias");
            assert_eq!(*actual, Device::Accelerator(1));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_only_full_precision_is_exported() {
    let err = OnnxExporter::new().trace(&HalfPrecision(token_classifier())).unwrap_err();
    assert!(matches!(export_error(&err), ExportError::UnsupportedPrecision(16)));
}

#[test]
fn test_check_can_be_disabled() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("unchecked.onnx");
    let summary = OnnxExporter::new().with_check(false).export(&token_classifier(), &path).unwrap();
    assert_eq!(summary.node_count, 3);
}

#[test]
fn test_load_model_rejects_garbage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.onnx");
    std::fs::write(&path, [0xffu8; 3]).unwrap();
    assert!(load_model(&path).is_err());
}
