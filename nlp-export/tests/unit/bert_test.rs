use super::*;
use crate::device::Device;
use crate::tensor::{Dim, ElemType};
use safetensors::tensor::{Dtype, TensorView, serialize_to_file};
use tempfile::TempDir;

fn tiny_config(num_hidden_layers: usize) -> BertConfig {
    BertConfig {
        vocab_size: 50,
        hidden_size: 8,
        num_hidden_layers,
        num_attention_heads: 2,
        intermediate_size: 16,
        max_position_embeddings: 16,
        type_vocab_size: 2,
        layer_norm_eps: 1e-12,
        hidden_act: "gelu".to_string(),
    }
}

fn trace_encoder(encoder: &BertEncoder) -> (crate::onnx::GraphProto, Value) {
    let mut t = GraphTracer::new("encoder", Device::Cpu);
    let ids = || vec![Dim::param("batch"), Dim::param("time")];
    let input_ids = t.input("input_ids", ElemType::Int64, ids()).unwrap();
    let attention_mask = t.input("attention_mask", ElemType::Int64, ids()).unwrap();
    let token_type_ids = t.input("token_type_ids", ElemType::Int64, ids()).unwrap();
    let hidden = encoder.trace(&mut t, &input_ids, &attention_mask, &token_type_ids).unwrap();
    (t.finish(&[]).unwrap(), hidden)
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn test_builtin_configs() {
    let base = BertConfig::builtin("bert-base-uncased").unwrap();
    assert_eq!((base.hidden_size, base.num_hidden_layers, base.num_attention_heads), (768, 12, 12));
    assert_eq!(base.intermediate_size, 3072);
    assert_eq!(base.vocab_size, 30522);
    assert_eq!(BertConfig::builtin("bert-large-cased").unwrap().num_hidden_layers, 24);
    assert!(BertConfig::builtin("roberta-base").is_none());
}

#[test]
fn test_config_from_huggingface_json() {
    let json = r#"{
        "architectures": ["BertForMaskedLM"],
        "vocab_size": 100, "hidden_size": 16, "num_hidden_layers": 2, "num_attention_heads": 4,
        "intermediate_size": 32, "max_position_embeddings": 64, "type_vocab_size": 2
    }"#;
    let config: BertConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.layer_norm_eps, 1e-12);
    assert_eq!(config.hidden_act, "gelu");
    assert_eq!(config.head_dim(), 4);
    config.validate().unwrap();
}

#[test]
fn test_validate_rejects_bad_configs() {
    let uneven = BertConfig { hidden_size: 10, num_attention_heads: 4, ..tiny_config(1) };
    let err = uneven.validate().unwrap_err();
    assert!(matches!(err.downcast_ref::<ExportError>(), Some(ExportError::InvalidConfig(_))));

    assert!(BertConfig { vocab_size: 0, ..tiny_config(1) }.validate().is_err());
    assert!(BertConfig { hidden_act: "swish".to_string(), ..tiny_config(1) }.validate().is_err());
}

#[test]
fn test_encoder_node_layout() {
    let encoder = BertEncoder::new(tiny_config(2), &ParameterInit::default()).unwrap();
    let (graph, hidden) = trace_encoder(&encoder);

    assert_eq!(graph.node.len(), 27 + 2 * 94);
    assert_eq!(graph.node[0].name, "Unsqueeze_0");
    assert_eq!(graph.node[10].name, "Range_10");
    assert_eq!(graph.node[27].name, "MatMul_27");
    assert_eq!(graph.node[30].name, "Add_30");
    assert_eq!(graph.node[27 + 43].name, "Softmax_70");
    assert_eq!(hidden.ty.elem, ElemType::Float);
    assert_eq!(hidden.ty.rank(), 3);
}

#[test]
fn test_relu_encoder_is_shorter() {
    let config = BertConfig { hidden_act: "relu".to_string(), ..tiny_config(1) };
    let encoder = BertEncoder::new(config, &ParameterInit::default()).unwrap();
    let (graph, _) = trace_encoder(&encoder);
    assert_eq!(graph.node.len(), 27 + 94 - 7);
}

#[test]
fn test_encoder_parameters() {
    let encoder = BertEncoder::new(tiny_config(2), &ParameterInit::default()).unwrap();
    let params = encoder.parameters();

    assert_eq!(params.len(), 5 + 2 * 16);
    assert_eq!(params[0].name, "bert_model.embeddings.word_embeddings.weight");
    assert_eq!(params[0].shape, vec![50, 8]);
    assert!(params.iter().any(|p| p.name == "bert_model.encoder.layer.1.output.LayerNorm.bias"));
    assert!(params.iter().any(|p| p.name == "bert_model.encoder.layer.0.intermediate.dense.weight" && p.shape == [8, 16]));
}

#[test]
fn test_checkpoint_names() {
    assert_eq!(
        checkpoint_names("bert_model.encoder.layer.0.attention.self.query.weight"),
        ["bert.encoder.layer.0.attention.self.query.weight", "encoder.layer.0.attention.self.query.weight"]
    );
    let norm = checkpoint_names("bert_model.embeddings.LayerNorm.weight");
    assert_eq!(norm.last().map(String::as_str), Some("bert.embeddings.LayerNorm.gamma"));
}

#[test]
fn test_transpose() {
    assert_eq!(transpose(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3), [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}

#[test]
fn test_load_pretrained_transposes_linear_weights() {
    let dir = TempDir::new().unwrap();
    let query: Vec<f32> = (0..64).map(|v| v as f32).collect();
    let gamma = vec![2.0f32; 8];
    let query_bytes = f32_bytes(&query);
    let gamma_bytes = f32_bytes(&gamma);

    let tensors = vec![
        (
            "bert.encoder.layer.0.attention.self.query.weight",
            TensorView::new(Dtype::F32, vec![8, 8], &query_bytes).unwrap(),
        ),
        ("bert.embeddings.LayerNorm.gamma", TensorView::new(Dtype::F32, vec![8], &gamma_bytes).unwrap()),
    ];
    serialize_to_file(tensors, &None, &dir.path().join("model.safetensors")).unwrap();

    let mut encoder = BertEncoder::new(tiny_config(1), &ParameterInit::default()).unwrap();
    assert_eq!(encoder.load_pretrained(dir.path()).unwrap(), 2);

    let params = encoder.parameters();
    let weight = params
        .iter()
        .find(|p| p.name == "bert_model.encoder.layer.0.attention.self.query.weight")
        .unwrap();
    // checkpoint [out, in] row 1 becomes column 1
    assert_eq!(weight.data[1], 8.0);
    assert_eq!(weight.data[8], 1.0);
    let norm = params.iter().find(|p| p.name == "bert_model.embeddings.LayerNorm.weight").unwrap();
    assert_eq!(norm.data, gamma);
}

#[test]
fn test_load_pretrained_without_matches_fails() {
    let dir = TempDir::new().unwrap();
    let bytes = f32_bytes(&[1.0]);
    let tensors = vec![("unrelated", TensorView::new(Dtype::F32, vec![1], &bytes).unwrap())];
    serialize_to_file(tensors, &None, &dir.path().join("model.safetensors")).unwrap();

    let mut encoder = BertEncoder::new(tiny_config(1), &ParameterInit::default()).unwrap();
    assert!(encoder.load_pretrained(dir.path()).is_err());
}

#[test]
fn test_load_pretrained_rejects_shape_mismatch() {
    let dir = TempDir::new().unwrap();
    let bytes = f32_bytes(&[0.0; 12]);
    let tensors = vec![(
        "bert.encoder.layer.0.attention.self.key.weight",
        TensorView::new(Dtype::F32, vec![3, 4], &bytes).unwrap(),
    )];
    serialize_to_file(tensors, &None, &dir.path().join("model.safetensors")).unwrap();

    let mut encoder = BertEncoder::new(tiny_config(1), &ParameterInit::default()).unwrap();
    assert!(encoder.load_pretrained(dir.path()).is_err());
}
