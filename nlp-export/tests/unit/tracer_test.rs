use super::*;
use crate::onnx::{IR_VERSION, ModelProto, OPSET_VERSION, OperatorSetIdProto};
use crate::tensor::{Init, ParameterInit};

fn hidden_input(t: &mut GraphTracer) -> Value {
    t.input("hidden_states", ElemType::Float, vec![Dim::param("batch"), Dim::param("time"), Dim::Fixed(4)])
        .unwrap()
}

#[test]
fn test_root_nodes_are_named_by_position() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);
    let two = t.constant(ConstTensor::scalar_f32(2.0)).unwrap();
    let y = t.binary("Mul", &x, &two).unwrap();
    t.unary("Relu", &y).unwrap();

    let graph = t.finish(&[]).unwrap();
    let names: Vec<&str> = graph.node.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["Constant_0", "Mul_1", "Relu_2"]);
    assert_eq!(graph.node[1].output, ["Mul_1_output_0"]);
}

#[test]
fn test_scoped_nodes_restart_counting() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);
    let y = t.unary("Relu", &x).unwrap();

    t.push_scope("ISC");
    let z = t.unary("Tanh", &y).unwrap();
    t.unary("Relu", &z).unwrap();
    t.pop_scope();
    t.unary("Sigmoid", &y).unwrap();

    let graph = t.finish(&[]).unwrap();
    let names: Vec<&str> = graph.node.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["Relu_0", "ISCTanh_0", "ISCRelu_1", "Sigmoid_1"]);
}

#[test]
fn test_pop_scope_keeps_root() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    t.pop_scope();
    let x = hidden_input(&mut t);
    t.unary("Relu", &x).unwrap();
    assert_eq!(t.finish(&[]).unwrap().node[0].name, "Relu_0");
}

#[test]
fn test_parameters_become_initializers_once() {
    let init = ParameterInit::default();
    let weight = init.create("w", &[4, 4], Init::Normal(0.02));

    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);
    let a = t.parameter(&weight).unwrap();
    let b = t.parameter(&weight).unwrap();
    assert_eq!(a, b);
    let y = t.binary("MatMul", &x, &a).unwrap();
    t.binary("MatMul", &y, &b).unwrap();

    let graph = t.finish(&[]).unwrap();
    assert_eq!(graph.initializer.len(), 1);
    assert_eq!(graph.initializer[0].name, "w");
    assert_eq!(graph.initializer[0].raw_data.len(), 16 * 4);
}

#[test]
fn test_parameter_on_other_device_is_rejected() {
    let weight = ParameterInit::default().create("encoder.weight", &[4, 4], Init::Zeros);

    let mut t = GraphTracer::new("g", Device::Accelerator(0));
    let err = t.parameter(&weight).unwrap_err();
    match err.downcast_ref::<ExportError>() {
        Some(ExportError::DeviceMismatch { name, expected, actual }) => {
            assert_eq!(name, "encoder.weight");
            assert_eq!(*expected, Device::Accelerator(0));
            assert_eq!(*actual, Device::Cpu);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_inference_failure_names_the_node() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);
    let bad = t.constant(ConstTensor::vec_i64(&[1, 2, 3])).unwrap();
    let err = t.binary("Add", &x, &bad).unwrap_err();
    match err.downcast_ref::<ExportError>() {
        Some(ExportError::Trace { node, .. }) => assert_eq!(node, "Add_1"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_duplicate_input_is_rejected() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    hidden_input(&mut t);
    assert!(t.input("hidden_states", ElemType::Float, Vec::new()).is_err());
}

#[test]
fn test_finish_renames_outputs() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);
    let y = t.unary("Relu", &x).unwrap();
    let z = t.unary("Tanh", &y).unwrap();

    let graph = t.finish(&[("relu_out", y), ("logits", z)]).unwrap();
    assert_eq!(graph.node[0].output, ["relu_out"]);
    assert_eq!(graph.node[1].input, ["relu_out"]);
    assert_eq!(graph.node[1].output, ["logits"]);
    let outputs: Vec<&str> = graph.output.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(outputs, ["relu_out", "logits"]);
}

#[test]
fn test_finish_binds_one_value_to_two_outputs() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);
    let y = t.unary("Relu", &x).unwrap();

    let graph = t.finish(&[("first", y.clone()), ("second", y)]).unwrap();
    assert_eq!(graph.node.len(), 2);
    assert_eq!(graph.node[0].output, ["first"]);
    assert_eq!(graph.node[1].op_type, "Identity");
    assert_eq!(graph.node[1].input, ["first"]);
    assert_eq!(graph.node[1].output, ["second"]);

    let model = ModelProto {
        ir_version: IR_VERSION,
        graph: Some(graph),
        opset_import: vec![OperatorSetIdProto { domain: String::new(), version: OPSET_VERSION }],
        ..Default::default()
    };
    crate::checker::check_model(&model, true).unwrap();
}

#[test]
fn test_finish_exposes_inputs_through_identity() {
    let mut t = GraphTracer::new("g", Device::Cpu);
    let x = hidden_input(&mut t);

    let graph = t.finish(&[("same", x)]).unwrap();
    assert_eq!(graph.node.len(), 1);
    assert_eq!(graph.node[0].op_type, "Identity");
    assert_eq!(graph.node[0].input, ["hidden_states"]);
    assert_eq!(graph.node[0].output, ["same"]);
}
