#[cfg(test)]
#[path = "../tests/unit/tracer_test.rs"]
mod tracer_test;

use anyhow::Result;
use log::debug;
use std::collections::{HashMap, HashSet};

use crate::device::Device;
use crate::error::ExportError;
use crate::onnx::{AttributeProto, GraphProto, NodeProto, TensorProto, ValueInfoProto};
use crate::shape_inference;
use crate::tensor::{ConstTensor, Dim, ElemType, Parameter, TensorType};

/// Handle to a tensor recorded in the traced graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub name: String,
    pub ty: TensorType,
}

#[derive(Debug)]
struct Scope {
    prefix: String,
    counter: usize,
}

/// Records the forward computation of a module as an ordered list of ONNX nodes.
///
/// Node names are `{prefix}{OpType}_{k}` where `k` counts the nodes emitted in the current
/// scope. The root scope has an empty prefix, so root node names carry their position.
/// Parameters become initializers; literals become `Constant` nodes.
#[derive(Debug)]
pub struct GraphTracer {
    graph_name: String,
    device: Device,
    scope: Scope,
    outer_scopes: Vec<Scope>,
    nodes: Vec<NodeProto>,
    inputs: Vec<ValueInfoProto>,
    initializers: Vec<TensorProto>,
    initializer_names: HashSet<String>,
    types: HashMap<String, TensorType>,
}

impl GraphTracer {
    pub fn new(graph_name: &str, device: Device) -> Self {
        Self {
            graph_name: graph_name.to_string(),
            device,
            scope: Scope { prefix: String::new(), counter: 0 },
            outer_scopes: Vec::new(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            initializers: Vec::new(),
            initializer_names: HashSet::new(),
            types: HashMap::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Declare a graph input.
    pub fn input(&mut self, name: &str, elem: ElemType, dims: Vec<Dim>) -> Result<Value> {
        if self.types.contains_key(name) {
            anyhow::bail!("Graph input '{name}' is declared twice");
        }
        let ty = TensorType::new(elem, dims);
        self.inputs.push(ty.to_value_info(name));
        self.types.insert(name.to_string(), ty.clone());
        Ok(Value { name: name.to_string(), ty })
    }

    /// Reference a parameter, registering it as an initializer on first use.
    pub fn parameter(&mut self, param: &Parameter) -> Result<Value> {
        if param.device != self.device {
            return Err(ExportError::DeviceMismatch {
                name: param.name.clone(),
                expected: self.device,
                actual: param.device,
            }
            .into());
        }

        let ty = param.tensor_type();
        if self.initializer_names.insert(param.name.clone()) {
            self.initializers.push(param.to_proto()?);
            self.types.insert(param.name.clone(), ty.clone());
        }
        Ok(Value { name: param.name.clone(), ty })
    }

    /// Emit a `Constant` node holding a literal tensor.
    pub fn constant(&mut self, value: ConstTensor) -> Result<Value> {
        let tensor = value.to_proto("value")?;
        self.op("Constant", &[], vec![AttributeProto::tensor("value", tensor)])
    }

    pub fn unary(&mut self, op_type: &str, x: &Value) -> Result<Value> {
        self.op(op_type, &[x], Vec::new())
    }

    pub fn binary(&mut self, op_type: &str, a: &Value, b: &Value) -> Result<Value> {
        self.op(op_type, &[a, b], Vec::new())
    }

    /// Emit one node with a single output and infer the output type.
    pub fn op(&mut self, op_type: &str, inputs: &[&Value], attributes: Vec<AttributeProto>) -> Result<Value> {
        let name = self.next_node_name(op_type);
        let input_types: Vec<TensorType> = inputs.iter().map(|v| v.ty.clone()).collect();

        let ty = shape_inference::infer(op_type, &input_types, &attributes)
            .map_err(|reason| ExportError::Trace { node: name.clone(), reason })?
            .remove(0);

        let output = format!("{name}_output_0");
        debug!("{name}: {op_type}({}) -> {ty}", inputs.iter().map(|v| v.name.as_str()).collect::<Vec<_>>().join(", "));

        self.nodes.push(NodeProto {
            input: inputs.iter().map(|v| v.name.clone()).collect(),
            output: vec![output.clone()],
            name,
            op_type: op_type.to_string(),
            attribute: attributes,
            ..Default::default()
        });
        self.types.insert(output.clone(), ty.clone());
        Ok(Value { name: output, ty })
    }

    /// Start naming nodes as `{prefix}{OpType}_{k}` with a fresh counter.
    pub fn push_scope(&mut self, prefix: &str) {
        let inner = Scope { prefix: prefix.to_string(), counter: 0 };
        self.outer_scopes.push(std::mem::replace(&mut self.scope, inner));
    }

    /// Return to the enclosing scope; the root scope stays in place.
    pub fn pop_scope(&mut self) {
        if let Some(outer) = self.outer_scopes.pop() {
            self.scope = outer;
        }
    }

    fn next_node_name(&mut self, op_type: &str) -> String {
        let name = format!("{}{op_type}_{}", self.scope.prefix, self.scope.counter);
        self.scope.counter += 1;
        name
    }

    /// Close the graph, binding each traced value to its declared output name.
    pub fn finish(mut self, outputs: &[(&str, Value)]) -> Result<GraphProto> {
        let mut output_infos = Vec::with_capacity(outputs.len());
        // traced name -> output name it was renamed to
        let mut bound: HashMap<&str, &str> = HashMap::new();

        for (output_name, value) in outputs {
            let renamed = bound.get(value.name.as_str()).copied();
            let produced_by_node = renamed.is_none() && self.nodes.iter().any(|node| node.output.contains(&value.name));
            if produced_by_node {
                self.rename(&value.name, output_name);
                bound.insert(value.name.as_str(), *output_name);
            } else {
                // graph inputs, initializers and values already bound are exposed through an Identity node
                let source = Value { name: renamed.unwrap_or(value.name.as_str()).to_string(), ty: value.ty.clone() };
                let identity = self.unary("Identity", &source)?;
                self.rename(&identity.name, output_name);
            }
            output_infos.push(value.ty.to_value_info(output_name));
        }

        debug!("Traced graph '{}' with {} nodes and {} initializers", self.graph_name, self.nodes.len(), self.initializers.len());

        Ok(GraphProto {
            node: self.nodes,
            name: self.graph_name,
            initializer: self.initializers,
            input: self.inputs,
            output: output_infos,
            ..Default::default()
        })
    }

    fn rename(&mut self, from: &str, to: &str) {
        for node in &mut self.nodes {
            for name in node.input.iter_mut().chain(node.output.iter_mut()) {
                if *name == from {
                    *name = to.to_string();
                }
            }
        }
        if let Some(ty) = self.types.remove(from) {
            self.types.insert(to.to_string(), ty);
        }
    }
}
