#[cfg(test)]
#[path = "../tests/unit/shape_inference_test.rs"]
mod shape_inference_test;

use crate::onnx::{AttributeProto, find_attribute};
use crate::tensor::{Dim, ElemType, TensorType};

/// Largest rank a Reshape target may declare.
const MAX_RANK: i64 = 64;

/// Arity and required attributes of a default-domain operator.
#[derive(Debug, Clone, Copy)]
pub struct OpSchema {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub outputs: usize,
    pub required_attributes: &'static [&'static str],
}

impl OpSchema {
    const fn new(min_inputs: usize, max_inputs: usize, required_attributes: &'static [&'static str]) -> Self {
        Self { min_inputs, max_inputs, outputs: 1, required_attributes }
    }
}

/// Schema of the operators this crate emits and understands (opset 11 semantics).
pub fn schema(op_type: &str) -> Option<OpSchema> {
    let schema = match op_type {
        "Add" | "Sub" | "Mul" | "Div" | "Pow" | "MatMul" => OpSchema::new(2, 2, &[]),
        "Relu" | "Tanh" | "Sigmoid" | "Erf" | "Sqrt" | "Identity" | "Shape" => OpSchema::new(1, 1, &[]),
        "Softmax" | "LogSoftmax" | "Transpose" | "ReduceMean" | "Squeeze" => OpSchema::new(1, 1, &[]),
        "Cast" => OpSchema::new(1, 1, &["to"]),
        "Constant" => OpSchema::new(0, 0, &["value"]),
        "Gather" | "Reshape" => OpSchema::new(2, 2, &[]),
        "Unsqueeze" => OpSchema::new(1, 1, &["axes"]),
        "Concat" => OpSchema::new(1, usize::MAX, &["axis"]),
        "Range" => OpSchema::new(3, 3, &[]),
        _ => return None,
    };
    Some(schema)
}

/// Infer output types of one node from its input types and attributes.
///
/// Errors are plain messages; callers wrap them with the node they belong to.
pub fn infer(op_type: &str, inputs: &[TensorType], attributes: &[AttributeProto]) -> Result<Vec<TensorType>, String> {
    let schema = schema(op_type).ok_or_else(|| format!("unsupported operator '{op_type}'"))?;
    if inputs.len() < schema.min_inputs || inputs.len() > schema.max_inputs {
        return Err(format!("{op_type} expects {}..={} inputs, got {}", schema.min_inputs, schema.max_inputs, inputs.len()));
    }
    if let Some(missing) = schema.required_attributes.iter().find(|name| find_attribute(attributes, name).is_none()) {
        return Err(format!("{op_type} requires attribute '{missing}'"));
    }

    let output = match op_type {
        "Add" | "Sub" | "Mul" | "Div" | "Pow" => elementwise(&inputs[0], &inputs[1])?,
        "MatMul" => matmul(&inputs[0], &inputs[1])?,
        "Relu" | "Tanh" | "Sigmoid" | "Erf" | "Sqrt" | "Identity" => inputs[0].clone(),
        "Softmax" | "LogSoftmax" => {
            let axis = int_attr(attributes, "axis").unwrap_or(1);
            normalize_axis(axis, inputs[0].rank())?;
            inputs[0].clone()
        }
        "Cast" => {
            let to = int_attr(attributes, "to").unwrap_or_default();
            let elem = ElemType::try_from(to as i32).map_err(|e| e.to_string())?;
            TensorType::new(elem, inputs[0].dims.clone())
        }
        "Constant" => constant(attributes)?,
        "Shape" => TensorType::new(ElemType::Int64, vec![Dim::Fixed(inputs[0].rank() as i64)]),
        "Gather" => gather(&inputs[0], &inputs[1], int_attr(attributes, "axis").unwrap_or(0))?,
        "Unsqueeze" => unsqueeze(&inputs[0], ints_attr(attributes, "axes").unwrap_or_default())?,
        "Squeeze" => squeeze(&inputs[0], ints_attr(attributes, "axes"))?,
        "Concat" => concat(inputs, int_attr(attributes, "axis").unwrap_or_default())?,
        "Reshape" => reshape(&inputs[0], &inputs[1])?,
        "Transpose" => transpose(&inputs[0], ints_attr(attributes, "perm"))?,
        "ReduceMean" => {
            let keepdims = int_attr(attributes, "keepdims").unwrap_or(1) != 0;
            reduce(&inputs[0], ints_attr(attributes, "axes"), keepdims)?
        }
        "Range" => range(inputs)?,
        _ => unreachable!("schema() and infer() cover the same operators"),
    };

    Ok(vec![output])
}

fn int_attr(attributes: &[AttributeProto], name: &str) -> Option<i64> {
    find_attribute(attributes, name).map(|attr| attr.i)
}

fn ints_attr<'a>(attributes: &'a [AttributeProto], name: &str) -> Option<&'a [i64]> {
    find_attribute(attributes, name).map(|attr| attr.ints.as_slice())
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, String> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if normalized < 0 || normalized >= rank {
        return Err(format!("axis {axis} is out of range for rank {rank}"));
    }
    Ok(normalized as usize)
}

/// Merge two dims that must describe the same extent.
fn merge_same(a: &Dim, b: &Dim) -> Result<Dim, String> {
    match (a, b) {
        (Dim::Fixed(x), Dim::Fixed(y)) if x != y => Err(format!("dimension mismatch: {x} vs {y}")),
        (Dim::Fixed(_), _) => Ok(a.clone()),
        (_, Dim::Fixed(_)) => Ok(b.clone()),
        (Dim::Param(p), Dim::Param(q)) if p != q => Ok(Dim::Unknown),
        (Dim::Unknown, _) => Ok(b.clone()),
        _ => Ok(a.clone()),
    }
}

/// Numpy-style broadcasting of one dim pair.
fn broadcast_dim(a: &Dim, b: &Dim) -> Result<Dim, String> {
    match (a, b) {
        (Dim::Fixed(1), other) | (other, Dim::Fixed(1)) => Ok(other.clone()),
        _ => merge_same(a, b),
    }
}

fn broadcast(a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>, String> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let da = (i + a.len()).checked_sub(rank).map(|j| &a[j]);
            let db = (i + b.len()).checked_sub(rank).map(|j| &b[j]);
            match (da, db) {
                (Some(x), Some(y)) => broadcast_dim(x, y),
                (Some(x), None) | (None, Some(x)) => Ok(x.clone()),
                (None, None) => unreachable!("index is below the larger rank"),
            }
        })
        .collect()
}

fn elementwise(a: &TensorType, b: &TensorType) -> Result<TensorType, String> {
    if a.elem != b.elem {
        return Err(format!("element type mismatch: {:?} vs {:?}", a.elem, b.elem));
    }
    Ok(TensorType::new(a.elem, broadcast(&a.dims, &b.dims)?))
}

fn matmul(a: &TensorType, b: &TensorType) -> Result<TensorType, String> {
    if a.elem != b.elem {
        return Err(format!("element type mismatch: {:?} vs {:?}", a.elem, b.elem));
    }
    if a.rank() == 0 || b.rank() == 0 {
        return Err("MatMul inputs must have rank >= 1".to_string());
    }

    let mut lhs = a.dims.clone();
    let mut rhs = b.dims.clone();
    let lhs_vector = lhs.len() == 1;
    let rhs_vector = rhs.len() == 1;
    if lhs_vector {
        lhs.insert(0, Dim::Fixed(1));
    }
    if rhs_vector {
        rhs.push(Dim::Fixed(1));
    }

    let (m, k_lhs) = (&lhs[lhs.len() - 2], &lhs[lhs.len() - 1]);
    let (k_rhs, n) = (&rhs[rhs.len() - 2], &rhs[rhs.len() - 1]);
    merge_same(k_lhs, k_rhs).map_err(|e| format!("MatMul inner {e}"))?;

    let mut dims = broadcast(&lhs[..lhs.len() - 2], &rhs[..rhs.len() - 2])?;
    if !lhs_vector {
        dims.push(m.clone());
    }
    if !rhs_vector {
        dims.push(n.clone());
    }
    Ok(TensorType::new(a.elem, dims))
}

fn constant(attributes: &[AttributeProto]) -> Result<TensorType, String> {
    let tensor = find_attribute(attributes, "value")
        .and_then(|attr| attr.t.as_ref())
        .ok_or_else(|| "Constant 'value' attribute holds no tensor".to_string())?;
    let elem = ElemType::try_from(tensor.data_type).map_err(|e| e.to_string())?;
    Ok(TensorType::new(elem, tensor.dims.iter().map(|&d| Dim::Fixed(d)).collect()))
}

fn gather(data: &TensorType, indices: &TensorType, axis: i64) -> Result<TensorType, String> {
    if !indices.elem.is_index() {
        return Err(format!("Gather indices must be int32/int64, got {:?}", indices.elem));
    }
    if data.rank() == 0 {
        return Err("Gather data must have rank >= 1".to_string());
    }
    let axis = normalize_axis(axis, data.rank())?;
    let dims = data.dims[..axis]
        .iter()
        .chain(indices.dims.iter())
        .chain(data.dims[axis + 1..].iter())
        .cloned()
        .collect();
    Ok(TensorType::new(data.elem, dims))
}

fn unsqueeze(input: &TensorType, axes: &[i64]) -> Result<TensorType, String> {
    let out_rank = input.rank() + axes.len();
    let mut positions = axes.iter().map(|&a| normalize_axis(a, out_rank)).collect::<Result<Vec<_>, _>>()?;
    positions.sort_unstable();
    if positions.windows(2).any(|w| w[0] == w[1]) {
        return Err(format!("Unsqueeze axes contain duplicates: {axes:?}"));
    }

    let mut dims = input.dims.clone();
    for position in positions {
        dims.insert(position, Dim::Fixed(1));
    }
    Ok(TensorType::new(input.elem, dims))
}

fn squeeze(input: &TensorType, axes: Option<&[i64]>) -> Result<TensorType, String> {
    let dims = match axes {
        Some(axes) => {
            let positions = axes.iter().map(|&a| normalize_axis(a, input.rank())).collect::<Result<Vec<_>, _>>()?;
            if let Some(&p) = positions.iter().find(|&&p| matches!(input.dims[p], Dim::Fixed(d) if d != 1)) {
                return Err(format!("cannot squeeze axis {p} of size {}", input.dims[p]));
            }
            input
                .dims
                .iter()
                .enumerate()
                .filter(|(i, _)| !positions.contains(i))
                .map(|(_, d)| d.clone())
                .collect()
        }
        None => input.dims.iter().filter(|d| **d != Dim::Fixed(1)).cloned().collect(),
    };
    Ok(TensorType::new(input.elem, dims))
}

fn concat(inputs: &[TensorType], axis: i64) -> Result<TensorType, String> {
    let first = &inputs[0];
    if first.rank() == 0 {
        return Err("Concat inputs must have rank >= 1".to_string());
    }
    let axis = normalize_axis(axis, first.rank())?;

    let mut dims = first.dims.clone();
    let mut total = Some(0i64);
    for input in inputs {
        if input.elem != first.elem || input.rank() != first.rank() {
            return Err(format!("Concat input {input} does not match {first}"));
        }
        for (i, dim) in input.dims.iter().enumerate() {
            if i == axis {
                total = match (total, dim) {
                    (Some(sum), Dim::Fixed(d)) => Some(sum + d),
                    _ => None,
                };
            } else {
                dims[i] = merge_same(&dims[i], dim)?;
            }
        }
    }
    dims[axis] = total.map_or(Dim::Unknown, Dim::Fixed);
    Ok(TensorType::new(first.elem, dims))
}

fn reshape(data: &TensorType, shape: &TensorType) -> Result<TensorType, String> {
    if shape.elem != ElemType::Int64 {
        return Err(format!("Reshape shape must be int64, got {:?}", shape.elem));
    }
    match shape.dims.as_slice() {
        [Dim::Fixed(rank)] if (0..=MAX_RANK).contains(rank) => Ok(TensorType::new(data.elem, vec![Dim::Unknown; *rank as usize])),
        [Dim::Fixed(rank)] => Err(format!("Reshape target rank {rank} is outside 0..={MAX_RANK}")),
        _ => Err("Reshape shape must be a 1-D tensor of static length".to_string()),
    }
}

fn transpose(input: &TensorType, perm: Option<&[i64]>) -> Result<TensorType, String> {
    let rank = input.rank();
    let perm: Vec<usize> = match perm {
        Some(perm) => perm.iter().map(|&p| normalize_axis(p, rank)).collect::<Result<_, _>>()?,
        None => (0..rank).rev().collect(),
    };
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&p| std::mem::replace(&mut seen[p], true)) {
        return Err(format!("invalid permutation {perm:?} for rank {rank}"));
    }
    Ok(TensorType::new(input.elem, perm.iter().map(|&p| input.dims[p].clone()).collect()))
}

fn reduce(input: &TensorType, axes: Option<&[i64]>, keepdims: bool) -> Result<TensorType, String> {
    let positions: Vec<usize> = match axes {
        Some(axes) => axes.iter().map(|&a| normalize_axis(a, input.rank())).collect::<Result<_, _>>()?,
        None => (0..input.rank()).collect(),
    };
    let dims = input
        .dims
        .iter()
        .enumerate()
        .filter_map(|(i, d)| match (positions.contains(&i), keepdims) {
            (true, true) => Some(Dim::Fixed(1)),
            (true, false) => None,
            (false, _) => Some(d.clone()),
        })
        .collect();
    Ok(TensorType::new(input.elem, dims))
}

fn range(inputs: &[TensorType]) -> Result<TensorType, String> {
    let elem = inputs[0].elem;
    if inputs.iter().any(|input| input.rank() != 0 || input.elem != elem) {
        return Err("Range expects three scalars of the same element type".to_string());
    }
    Ok(TensorType::new(elem, vec![Dim::Unknown]))
}
