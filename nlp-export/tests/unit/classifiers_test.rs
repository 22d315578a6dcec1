use super::*;
use crate::device::Device;
use crate::model_exporter::OnnxExporter;
use crate::onnx::GraphProto;

fn config(num_layers: usize) -> ClassifierConfig {
    ClassifierConfig { hidden_size: 8, num_classes: 4, num_layers, ..Default::default() }
}

fn trace(model: &dyn Exportable) -> GraphProto {
    OnnxExporter::new().trace(model).unwrap().graph.unwrap()
}

fn op_types(graph: &GraphProto) -> Vec<&str> {
    graph.node.iter().map(|n| n.op_type.as_str()).collect()
}

fn output_type(graph: &GraphProto, index: usize) -> TensorType {
    TensorType::from_value_info(&graph.output[index]).unwrap()
}

fn assert_invalid(result: Result<impl std::fmt::Debug>) {
    let err = result.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<ExportError>(), Some(ExportError::InvalidConfig(_))),
        "expected InvalidConfig, got {err:?}"
    );
}

#[test]
fn test_token_classifier_single_layer() {
    let head = TokenClassifier::new(TokenClassifier::default_config(8, 4)).unwrap();
    let graph = trace(&head);

    assert_eq!(op_types(&graph), ["MatMul", "Add", "LogSoftmax"]);
    assert_eq!(graph.input[0].name, "hidden_states");
    assert_eq!(graph.output[0].name, "logits");
    assert_eq!(output_type(&graph, 0).dims, vec![Dim::param("batch"), Dim::param("time"), Dim::Fixed(4)]);
}

#[test]
fn test_token_classifier_parameter_names() {
    let head = TokenClassifier::new(config(2)).unwrap();
    let names: Vec<&str> = head.parameters().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["mlp.layer0.weight", "mlp.layer0.bias", "mlp.layer2.weight", "mlp.layer2.bias"]);
    assert_eq!(head.parameters()[2].shape, vec![8, 4]);
}

#[test]
fn test_hidden_layers_use_activation() {
    let head = TokenClassifier::new(ClassifierConfig { activation: Activation::Tanh, ..config(3) }).unwrap();
    let graph = trace(&head);
    assert_eq!(op_types(&graph), ["MatMul", "Add", "Tanh", "MatMul", "Add", "Tanh", "MatMul", "Add", "LogSoftmax"]);
}

#[test]
fn test_bert_pretraining_head_normalizes_before_mlp() {
    let head = BertPretrainingTokenClassifier::new(config(1)).unwrap();
    let graph = trace(&head);
    let ops = op_types(&graph);

    assert_eq!(ops.len(), 2 + 1 + 11 + 2 + 1);
    assert_eq!(&ops[..4], ["MatMul", "Add", "Relu", "ReduceMean"]);
    assert_eq!(ops.last(), Some(&"LogSoftmax"));
    assert!(head.parameters().iter().any(|p| p.name == "norm.weight"));
}

#[test]
fn test_sequence_classifier_conditions_on_token() {
    let head = SequenceClassifier::new(ClassifierConfig { idx_conditioned_on: 3, ..config(2) }).unwrap();
    let graph = trace(&head);

    assert_eq!(&op_types(&graph)[..2], ["Constant", "Gather"]);
    assert_eq!(graph.node[1].attr("axis").map(|a| a.i), Some(1));
    let index = graph.node[0].attr("value").and_then(|a| a.t.as_ref()).unwrap();
    assert_eq!(index.raw_data, 3i64.to_le_bytes());
    assert_eq!(output_type(&graph, 0).dims, vec![Dim::param("batch"), Dim::Fixed(4)]);
}

#[test]
fn test_sequence_regression_outputs_one_value_per_sequence() {
    let head = SequenceRegression::new(ClassifierConfig { num_classes: 7, log_softmax: true, ..config(2) }).unwrap();
    let graph = trace(&head);

    assert_eq!(graph.output[0].name, "preds");
    assert_eq!(op_types(&graph).last(), Some(&"Squeeze"));
    assert!(!op_types(&graph).contains(&"LogSoftmax"));
    assert_eq!(output_type(&graph, 0).dims, vec![Dim::param("batch")]);
}

#[test]
fn test_sequence_token_classifier_outputs() {
    let config = SequenceTokenClassifierConfig { hidden_size: 8, num_intents: 3, num_slots: 5, ..Default::default() };
    let head = SequenceTokenClassifier::new(config).unwrap();
    let graph = trace(&head);

    assert_eq!(graph.node.len(), 2 + 5 + 5);
    let outputs: Vec<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(outputs, ["intent_logits", "slot_logits"]);
    assert_eq!(output_type(&graph, 0).dims, vec![Dim::param("batch"), Dim::Fixed(3)]);
    assert_eq!(output_type(&graph, 1).dims, vec![Dim::param("batch"), Dim::param("time"), Dim::Fixed(5)]);
}

#[test]
fn test_prefix_scopes_parameter_names() {
    let config = SequenceTokenClassifierConfig { hidden_size: 8, ..Default::default() };
    let head = SequenceTokenClassifier::with_init(config, &ParameterInit::default(), "classifier").unwrap();
    assert!(head.parameters().iter().all(|p| p.name.starts_with("classifier.")));
}

#[test]
fn test_invalid_hyperparameters() {
    assert_invalid(TokenClassifier::new(ClassifierConfig { hidden_size: 0, ..config(1) }));
    assert_invalid(TokenClassifier::new(config(0)));
    assert_invalid(SequenceClassifier::new(ClassifierConfig { num_classes: 0, ..config(1) }));
    assert_invalid(SequenceClassifier::new(ClassifierConfig { dropout: 1.0, ..config(1) }));
    assert_invalid(SequenceTokenClassifier::new(SequenceTokenClassifierConfig { num_slots: 0, ..Default::default() }));
}

#[test]
fn test_construction_is_deterministic() {
    let a = TokenClassifier::new(config(2)).unwrap();
    let b = TokenClassifier::new(config(2)).unwrap();
    assert_eq!(a.parameters(), b.parameters());
}

#[test]
fn test_to_moves_every_parameter() {
    let head = SequenceClassifier::new(config(2)).unwrap().to(Device::Accelerator(1));
    assert_eq!(head.device().unwrap(), Device::Accelerator(1));
    assert_eq!(trace(&head).node.len(), 8);
}
