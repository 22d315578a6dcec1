//! Structural validation of ONNX models, used both before writing and after loading.

#[cfg(test)]
#[path = "../tests/unit/checker_test.rs"]
mod checker_test;

use anyhow::Result;
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::error::ExportError;
use crate::onnx::{GraphProto, ModelProto, NodeProto, TensorProto};
use crate::shape_inference;
use crate::tensor::{Dim, ElemType, TensorType};

const MIN_IR_VERSION: i64 = 3;

fn is_default_domain(domain: &str) -> bool {
    domain.is_empty() || domain == "ai.onnx"
}

/// Validate `model`.
///
/// The basic pass checks model metadata, SSA naming, topological order, operator schemas,
/// initializer payloads and that every graph output is produced. With `full` set, types are
/// inferred through the whole graph and compared with the declared outputs.
pub fn check_model(model: &ModelProto, full: bool) -> Result<()> {
    if model.ir_version < MIN_IR_VERSION {
        return Err(ExportError::check(format!("IR version {} is below {MIN_IR_VERSION}", model.ir_version)).into());
    }
    if !model.opset_import.iter().any(|opset| is_default_domain(&opset.domain)) {
        return Err(ExportError::check("model does not import the default operator set").into());
    }
    let graph = model.graph.as_ref().ok_or_else(|| ExportError::check("model has no graph"))?;

    check_graph(graph)?;
    if full {
        check_types(graph)?;
    }
    debug!("Graph '{}' passed the {} check", graph.name, if full { "full" } else { "basic" });
    Ok(())
}

fn check_graph(graph: &GraphProto) -> Result<()> {
    let mut defined: HashSet<&str> = HashSet::new();

    for input in &graph.input {
        if !defined.insert(input.name.as_str()) {
            return Err(ExportError::check(format!("graph input '{}' is declared twice", input.name)).into());
        }
    }
    // an initializer may back a graph input of the same name, which IR < 4 requires
    let mut initializers: HashSet<&str> = HashSet::new();
    for tensor in &graph.initializer {
        check_initializer(tensor)?;
        if !initializers.insert(tensor.name.as_str()) {
            return Err(ExportError::check(format!("initializer '{}' is defined twice", tensor.name)).into());
        }
        defined.insert(tensor.name.as_str());
    }

    for (index, node) in graph.node.iter().enumerate() {
        check_node_schema(index, node)?;
        if let Some(dangling) = node.input.iter().find(|name| !name.is_empty() && !defined.contains(name.as_str())) {
            return Err(ExportError::check(format!(
                "node {index} '{}' reads '{dangling}', which is not defined before it",
                node.name
            ))
            .into());
        }
        for output in &node.output {
            if !defined.insert(output.as_str()) {
                return Err(ExportError::check(format!("node {index} '{}' redefines '{output}'", node.name)).into());
            }
        }
    }

    if let Some(missing) = graph.output.iter().find(|output| !defined.contains(output.name.as_str())) {
        return Err(ExportError::check(format!("graph output '{}' is never produced", missing.name)).into());
    }
    Ok(())
}

fn check_node_schema(index: usize, node: &NodeProto) -> Result<()> {
    let fail = |reason: String| -> anyhow::Error { ExportError::check(format!("node {index} '{}': {reason}", node.name)).into() };

    if !is_default_domain(&node.domain) {
        return Err(fail(format!("unsupported domain '{}'", node.domain)));
    }
    let schema = shape_inference::schema(&node.op_type).ok_or_else(|| fail(format!("unknown operator '{}'", node.op_type)))?;
    if node.input.len() < schema.min_inputs || node.input.len() > schema.max_inputs {
        return Err(fail(format!("{} takes {}..={} inputs, got {}", node.op_type, schema.min_inputs, schema.max_inputs, node.input.len())));
    }
    if node.output.len() != schema.outputs {
        return Err(fail(format!("{} has {} outputs, got {}", node.op_type, schema.outputs, node.output.len())));
    }
    if let Some(missing) = schema.required_attributes.iter().find(|name| node.attr(name).is_none()) {
        return Err(fail(format!("{} requires attribute '{missing}'", node.op_type)));
    }
    Ok(())
}

fn check_initializer(tensor: &TensorProto) -> Result<()> {
    let elem = ElemType::try_from(tensor.data_type)
        .map_err(|e| ExportError::check(format!("initializer '{}': {e}", tensor.name)))?;
    if tensor.dims.iter().any(|&d| d < 0) {
        return Err(ExportError::check(format!("initializer '{}' has negative dims {:?}", tensor.name, tensor.dims)).into());
    }
    let numel = tensor
        .dims
        .iter()
        .try_fold(1i64, |acc, &d| acc.checked_mul(d))
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ExportError::check(format!("initializer '{}' dims {:?} overflow the element count", tensor.name, tensor.dims)))?;

    let actual = if tensor.raw_data.is_empty() {
        match elem {
            ElemType::Float => tensor.float_data.len(),
            ElemType::Int32 | ElemType::Bool => tensor.int32_data.len(),
            ElemType::Int64 => tensor.int64_data.len(),
            ElemType::Double => tensor.double_data.len(),
        }
    } else {
        if tensor.raw_data.len() % elem.byte_size() != 0 {
            return Err(ExportError::check(format!("initializer '{}' raw data is not a whole number of elements", tensor.name)).into());
        }
        tensor.raw_data.len() / elem.byte_size()
    };

    if actual != numel {
        return Err(ExportError::check(format!(
            "initializer '{}' holds {actual} elements, dims {:?} need {numel}",
            tensor.name, tensor.dims
        ))
        .into());
    }
    Ok(())
}

fn check_types(graph: &GraphProto) -> Result<()> {
    let mut types: HashMap<&str, TensorType> = HashMap::new();

    for input in &graph.input {
        let ty = TensorType::from_value_info(input)
            .map_err(|e| ExportError::check(format!("graph input '{}': {e}", input.name)))?;
        types.insert(input.name.as_str(), ty);
    }
    for tensor in &graph.initializer {
        let elem = ElemType::try_from(tensor.data_type).map_err(|e| ExportError::check(e.to_string()))?;
        types.insert(tensor.name.as_str(), TensorType::new(elem, tensor.dims.iter().map(|&d| Dim::Fixed(d)).collect()));
    }

    for (index, node) in graph.node.iter().enumerate() {
        let input_types = node
            .input
            .iter()
            .map(|name| types.get(name.as_str()).cloned())
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ExportError::check(format!("node {index} '{}' has inputs of unknown type", node.name)))?;
        let output_types = shape_inference::infer(&node.op_type, &input_types, &node.attribute)
            .map_err(|reason| ExportError::check(format!("node {index} '{}': {reason}", node.name)))?;
        for (name, ty) in node.output.iter().zip(output_types) {
            types.insert(name.as_str(), ty);
        }
    }

    for output in &graph.output {
        let declared = TensorType::from_value_info(output)
            .map_err(|e| ExportError::check(format!("graph output '{}': {e}", output.name)))?;
        let inferred = types
            .get(output.name.as_str())
            .ok_or_else(|| ExportError::check(format!("graph output '{}' has no inferred type", output.name)))?;
        if declared.elem != inferred.elem || declared.rank() != inferred.rank() {
            return Err(ExportError::check(format!(
                "graph output '{}' is declared as {declared} but computes {inferred}",
                output.name
            ))
            .into());
        }
    }
    Ok(())
}
