use anyhow::Result;
use std::fmt;
use std::str::FromStr;

use crate::error::ExportError;
use crate::onnx::AttributeProto;
use crate::tensor::{ConstTensor, Init, Parameter, ParameterInit};
use crate::tracer::{GraphTracer, Value};

/// Standard deviation of the transformer-style normal initializer.
pub const TRANSFORMER_INIT_STD: f32 = 0.02;

/// Activation between hidden layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
    Tanh,
}

impl Activation {
    pub fn trace(&self, t: &mut GraphTracer, x: &Value) -> Result<Value> {
        match self {
            Activation::Relu => t.unary("Relu", x),
            Activation::Tanh => t.unary("Tanh", x),
            Activation::Gelu => gelu(t, x),
        }
    }
}

impl FromStr for Activation {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(ExportError::invalid(format!("unknown activation '{value}'")).into()),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Tanh => "tanh",
        };
        write!(f, "{name}")
    }
}

/// Exact (erf based) GELU: `x * 0.5 * (1 + erf(x / sqrt(2)))`.
pub fn gelu(t: &mut GraphTracer, x: &Value) -> Result<Value> {
    let sqrt2 = t.constant(ConstTensor::scalar_f32(std::f32::consts::SQRT_2))?;
    let scaled = t.binary("Div", x, &sqrt2)?;
    let erf = t.unary("Erf", &scaled)?;
    let one = t.constant(ConstTensor::scalar_f32(1.0))?;
    let shifted = t.binary("Add", &erf, &one)?;
    let gated = t.binary("Mul", x, &shifted)?;
    let half = t.constant(ConstTensor::scalar_f32(0.5))?;
    t.binary("Mul", &gated, &half)
}

/// Fully connected layer, weight stored as `[in_features, out_features]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Parameter,
}

impl Linear {
    pub fn new(init: &ParameterInit, name: &str, in_features: usize, out_features: usize, transformer_init: bool) -> Self {
        let weight_init = if transformer_init {
            Init::Normal(TRANSFORMER_INIT_STD)
        } else {
            Init::Uniform(1.0 / (in_features as f32).sqrt())
        };
        Self {
            weight: init.create(format!("{name}.weight"), &[in_features, out_features], weight_init),
            bias: init.create(format!("{name}.bias"), &[out_features], Init::Zeros),
        }
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// `MatMul` followed by the bias `Add`.
    pub fn trace(&self, t: &mut GraphTracer, x: &Value) -> Result<Value> {
        let weight = t.parameter(&self.weight)?;
        let bias = t.parameter(&self.bias)?;
        let projected = t.binary("MatMul", x, &weight)?;
        t.binary("Add", &projected, &bias)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Layer normalization over the last axis, decomposed into primitive ops.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub weight: Parameter,
    pub bias: Parameter,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(init: &ParameterInit, name: &str, size: usize, eps: f32) -> Self {
        Self {
            weight: init.create(format!("{name}.weight"), &[size], Init::Ones),
            bias: init.create(format!("{name}.bias"), &[size], Init::Zeros),
            eps,
        }
    }

    pub fn trace(&self, t: &mut GraphTracer, x: &Value) -> Result<Value> {
        let last_axis = || vec![AttributeProto::ints("axes", &[-1]), AttributeProto::int("keepdims", 1)];

        let mean = t.op("ReduceMean", &[x], last_axis())?;
        let centered = t.binary("Sub", x, &mean)?;
        let two = t.constant(ConstTensor::scalar_f32(2.0))?;
        let squared = t.binary("Pow", &centered, &two)?;
        let variance = t.op("ReduceMean", &[&squared], last_axis())?;
        let eps = t.constant(ConstTensor::scalar_f32(self.eps))?;
        let shifted = t.binary("Add", &variance, &eps)?;
        let std = t.unary("Sqrt", &shifted)?;
        let normalized = t.binary("Div", &centered, &std)?;

        let weight = t.parameter(&self.weight)?;
        let bias = t.parameter(&self.bias)?;
        let scaled = t.binary("Mul", &normalized, &weight)?;
        t.binary("Add", &scaled, &bias)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }
}

/// Stack of linear layers with an activation between them and an optional log-softmax.
///
/// `num_layers - 1` hidden layers keep the hidden size; the last one projects to `num_classes`.
/// Linear layers are named `{name}.layer{2 * i}`, leaving odd indices to the activations.
#[derive(Debug, Clone)]
pub struct MultiLayerPerceptron {
    layers: Vec<Linear>,
    activation: Activation,
    log_softmax: bool,
}

impl MultiLayerPerceptron {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        init: &ParameterInit,
        name: &str,
        hidden_size: usize,
        num_classes: usize,
        num_layers: usize,
        activation: Activation,
        log_softmax: bool,
        transformer_init: bool,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|i| {
                let out_features = if i + 1 == num_layers { num_classes } else { hidden_size };
                Linear::new(init, &format!("{name}.layer{}", 2 * i), hidden_size, out_features, transformer_init)
            })
            .collect();
        Self { layers, activation, log_softmax }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn trace(&self, t: &mut GraphTracer, x: &Value) -> Result<Value> {
        let mut hidden = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.trace(t, &hidden)?;
            if i + 1 < self.layers.len() {
                hidden = self.activation.trace(t, &hidden)?;
            }
        }
        if self.log_softmax {
            hidden = t.op("LogSoftmax", &[&hidden], vec![AttributeProto::int("axis", -1)])?;
        }
        Ok(hidden)
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(Linear::parameters).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers.iter_mut().flat_map(Linear::parameters_mut).collect()
    }
}
