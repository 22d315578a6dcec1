use super::*;
use crate::onnx::AttributeProto;
use crate::tensor::ConstTensor;

fn float(dims: Vec<Dim>) -> TensorType {
    TensorType::new(ElemType::Float, dims)
}

fn hidden(size: i64) -> TensorType {
    float(vec![Dim::param("batch"), Dim::param("time"), Dim::Fixed(size)])
}

#[test]
fn test_schema_covers_emitted_operators() {
    for op in ["Add", "MatMul", "Gather", "Reshape", "Concat", "Range", "Constant", "LogSoftmax", "Erf"] {
        assert!(schema(op).is_some(), "{op} should be known");
    }
    assert!(schema("Conv").is_none());
    assert_eq!(schema("Concat").unwrap().max_inputs, usize::MAX);
    assert_eq!(schema("Cast").unwrap().required_attributes, &["to"]);
}

#[test]
fn test_unknown_operator_is_rejected() {
    let err = infer("Conv", &[hidden(4)], &[]).unwrap_err();
    assert!(err.contains("unsupported operator"));
}

#[test]
fn test_arity_and_required_attributes() {
    assert!(infer("Add", &[hidden(4)], &[]).unwrap_err().contains("inputs"));
    assert!(infer("Unsqueeze", &[hidden(4)], &[]).unwrap_err().contains("axes"));
}

#[test]
fn test_broadcast_keeps_symbolic_dims() {
    let bias = TensorType::fixed(ElemType::Float, &[4]);
    let out = infer("Add", &[hidden(4), bias], &[]).unwrap().remove(0);
    assert_eq!(out, hidden(4));

    let scalar = TensorType::scalar(ElemType::Float);
    let out = infer("Mul", &[scalar, hidden(4)], &[]).unwrap().remove(0);
    assert_eq!(out, hidden(4));
}

#[test]
fn test_broadcast_rejects_fixed_mismatch() {
    let other = TensorType::fixed(ElemType::Float, &[3]);
    assert!(infer("Add", &[hidden(4), other], &[]).unwrap_err().contains("dimension mismatch"));
}

#[test]
fn test_elementwise_rejects_mixed_element_types() {
    let ids = TensorType::new(ElemType::Int64, vec![Dim::param("batch"), Dim::param("time")]);
    let mask = float(vec![Dim::param("batch"), Dim::param("time")]);
    assert!(infer("Sub", &[mask, ids], &[]).unwrap_err().contains("element type mismatch"));
}

#[test]
fn test_matmul_projects_last_dim() {
    let weight = TensorType::fixed(ElemType::Float, &[4, 16]);
    let out = infer("MatMul", &[hidden(4), weight], &[]).unwrap().remove(0);
    assert_eq!(out, hidden(16));

    let bad = TensorType::fixed(ElemType::Float, &[5, 16]);
    assert!(infer("MatMul", &[hidden(4), bad], &[]).unwrap_err().contains("MatMul inner"));
}

#[test]
fn test_gather_along_time_drops_axis() {
    let index = TensorType::scalar(ElemType::Int64);
    let attrs = [AttributeProto::int("axis", 1)];
    let out = infer("Gather", &[hidden(8), index], &attrs).unwrap().remove(0);
    assert_eq!(out, float(vec![Dim::param("batch"), Dim::Fixed(8)]));
}

#[test]
fn test_gather_embedding_lookup() {
    let table = TensorType::fixed(ElemType::Float, &[100, 8]);
    let ids = TensorType::new(ElemType::Int64, vec![Dim::param("batch"), Dim::param("time")]);
    let out = infer("Gather", &[table, ids], &[]).unwrap().remove(0);
    assert_eq!(out, hidden(8));

    let float_ids = float(vec![Dim::param("batch")]);
    let table = TensorType::fixed(ElemType::Float, &[100, 8]);
    assert!(infer("Gather", &[table, float_ids], &[]).unwrap_err().contains("indices"));
}

#[test]
fn test_unsqueeze_and_cast_of_attention_mask() {
    let mask = TensorType::new(ElemType::Int64, vec![Dim::param("batch"), Dim::param("time")]);
    let expanded = infer("Unsqueeze", &[mask], &[AttributeProto::ints("axes", &[1, 2])]).unwrap().remove(0);
    assert_eq!(expanded.dims, vec![Dim::param("batch"), Dim::Fixed(1), Dim::Fixed(1), Dim::param("time")]);

    let cast = infer("Cast", &[expanded], &[AttributeProto::int("to", ElemType::Float as i64)]).unwrap().remove(0);
    assert_eq!(cast.elem, ElemType::Float);
}

#[test]
fn test_squeeze_rejects_non_unit_axis() {
    let preds = float(vec![Dim::param("batch"), Dim::Fixed(1)]);
    let out = infer("Squeeze", &[preds], &[AttributeProto::ints("axes", &[-1])]).unwrap().remove(0);
    assert_eq!(out.dims, vec![Dim::param("batch")]);

    assert!(infer("Squeeze", &[hidden(4)], &[AttributeProto::ints("axes", &[2])]).is_err());
}

#[test]
fn test_scalar_has_no_axis() {
    let scalar = TensorType::scalar(ElemType::Float);
    let err = infer("Squeeze", &[scalar.clone()], &[AttributeProto::ints("axes", &[0])]).unwrap_err();
    assert!(err.contains("out of range for rank 0"));
    assert!(infer("Softmax", &[scalar.clone()], &[AttributeProto::int("axis", -1)]).is_err());

    let out = infer("Unsqueeze", &[scalar], &[AttributeProto::ints("axes", &[0])]).unwrap().remove(0);
    assert_eq!(out, TensorType::fixed(ElemType::Float, &[1]));
}

#[test]
fn test_concat_sums_static_lengths() {
    let one = TensorType::fixed(ElemType::Int64, &[1]);
    let two = TensorType::fixed(ElemType::Int64, &[2]);
    let out = infer("Concat", &[one.clone(), one, two], &[AttributeProto::int("axis", 0)]).unwrap().remove(0);
    assert_eq!(out, TensorType::fixed(ElemType::Int64, &[4]));
}

#[test]
fn test_reshape_rank_comes_from_shape_length() {
    let target = TensorType::fixed(ElemType::Int64, &[4]);
    let out = infer("Reshape", &[hidden(8), target], &[]).unwrap().remove(0);
    assert_eq!(out.rank(), 4);
    assert!(out.dims.iter().all(|d| *d == Dim::Unknown));
}

#[test]
fn test_reshape_rejects_unbounded_target_rank() {
    for length in [-3, 1 << 40] {
        let target = TensorType::new(ElemType::Int64, vec![Dim::Fixed(length)]);
        let err = infer("Reshape", &[hidden(8), target], &[]).unwrap_err();
        assert!(err.contains("target rank"), "{length}: {err}");
    }
}

#[test]
fn test_transpose_validates_permutation() {
    let x = float(vec![Dim::Fixed(1), Dim::Fixed(2), Dim::Fixed(3), Dim::Fixed(4)]);
    let out = infer("Transpose", &[x.clone()], &[AttributeProto::ints("perm", &[0, 2, 3, 1])]).unwrap().remove(0);
    assert_eq!(out, float(vec![Dim::Fixed(1), Dim::Fixed(3), Dim::Fixed(4), Dim::Fixed(2)]));

    assert!(infer("Transpose", &[x], &[AttributeProto::ints("perm", &[0, 0, 1, 2])]).is_err());
}

#[test]
fn test_reduce_mean_keepdims() {
    let attrs = [AttributeProto::ints("axes", &[-1]), AttributeProto::int("keepdims", 1)];
    let out = infer("ReduceMean", &[hidden(8)], &attrs).unwrap().remove(0);
    assert_eq!(out, hidden(1));
}

#[test]
fn test_range_over_scalars() {
    let scalar = TensorType::scalar(ElemType::Int64);
    let out = infer("Range", &[scalar.clone(), scalar.clone(), scalar], &[]).unwrap().remove(0);
    assert_eq!(out, TensorType::new(ElemType::Int64, vec![Dim::Unknown]));
}

#[test]
fn test_constant_type_comes_from_tensor() {
    let value = ConstTensor::vec_i64(&[4, 8]).to_proto("value").unwrap();
    let out = infer("Constant", &[], &[AttributeProto::tensor("value", value)]).unwrap().remove(0);
    assert_eq!(out, TensorType::fixed(ElemType::Int64, &[2]));
}
