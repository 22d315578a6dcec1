use super::*;
use crate::model_exporter::OnnxExporter;
use crate::models::{SequenceTokenClassifier, SequenceTokenClassifierConfig};
use tempfile::TempDir;

fn model() -> ModelProto {
    let config = SequenceTokenClassifierConfig { hidden_size: 8, num_intents: 2, num_slots: 3, ..Default::default() };
    OnnxExporter::new().trace(&SequenceTokenClassifier::new(config).unwrap()).unwrap()
}

fn mismatch(manifest: &GraphManifest, model: &ModelProto) -> Vec<String> {
    let err = manifest.verify(model).unwrap_err();
    err.downcast_ref::<SnapshotMismatch>().expect("snapshot mismatch").differences.clone()
}

#[test]
fn test_capture_records_structure() {
    let manifest = GraphManifest::capture(&model(), &[0, 1, 11]).unwrap();

    assert_eq!(manifest.node_count, 12);
    assert_eq!(manifest.nodes[&0], "Constant_0");
    assert_eq!(manifest.nodes[&1], "Gather_1");
    assert_eq!(manifest.nodes[&11], "Add_11");
    assert_eq!(manifest.inputs, ["hidden_states"]);
    assert_eq!(manifest.outputs, ["intent_logits", "slot_logits"]);
    assert_eq!(manifest.pins(), [0, 1, 11]);
    manifest.verify(&model()).unwrap();
}

#[test]
fn test_capture_rejects_pins_out_of_range() {
    assert!(GraphManifest::capture(&model(), &[12]).is_err());
}

#[test]
fn test_verify_reports_every_difference() {
    let mut manifest = GraphManifest::capture(&model(), &[0]).unwrap();
    manifest.node_count = 13;
    manifest.nodes.insert(0, "Unsqueeze_0".to_string());
    manifest.nodes.insert(40, "Add_40".to_string());
    manifest.outputs.reverse();

    let differences = mismatch(&manifest, &model());
    assert_eq!(differences.len(), 4);
    assert!(differences[0].contains("node count"));
    assert!(differences[1].contains("'Unsqueeze_0'"));
    assert!(differences[2].contains("no such node"));
    assert!(differences[3].starts_with("outputs"));
}

#[test]
fn test_manifest_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("manifest.json");
    let manifest = GraphManifest::capture(&model(), &[2, 7]).unwrap();

    manifest.save(&path).unwrap();
    assert_eq!(GraphManifest::load(&path).unwrap(), manifest);

    let json = std::fs::read_to_string(&path).unwrap();
    assert!(json.contains("\"7\": \"MatMul_7\""));
}

#[test]
fn test_manifest_json_format() {
    let json = r#"{"node_count": 12, "nodes": {"11": "Add_11"}, "inputs": ["hidden_states"], "outputs": ["intent_logits", "slot_logits"]}"#;
    let manifest: GraphManifest = serde_json::from_str(json).unwrap();
    assert_eq!(manifest.pins(), [11]);
    manifest.verify(&model()).unwrap();
}

#[test]
fn test_bless_or_verify() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("golden.json");
    GraphManifest::capture(&model(), &[3]).unwrap().save(&path).unwrap();

    if std::env::var_os(BLESS_ENV).is_none() {
        bless_or_verify(&path, &model()).unwrap();
    }
    assert_eq!(GraphManifest::load(&path).unwrap().pins(), [3]);
}
