#[cfg(test)]
#[path = "../../tests/unit/bert_test.rs"]
mod bert_test;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::Module;
use super::layers::{Activation, LayerNorm, Linear, TRANSFORMER_INIT_STD};
use crate::error::ExportError;
use crate::onnx::AttributeProto;
use crate::tensor::{ConstTensor, ElemType, Init, Parameter, ParameterInit};
use crate::tensor_reader::TensorReader;
use crate::tracer::{GraphTracer, Value};

const PREFIX: &str = "bert_model";

/// Additive bias applied to masked attention positions.
const MASKED_ATTENTION_BIAS: f32 = -10000.0;

/// BERT encoder hyperparameters, named like a HuggingFace `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_layer_norm_eps() -> f32 {
    1e-12
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

impl BertConfig {
    /// Architecture of a well-known pretrained checkpoint.
    pub fn builtin(pretrained_model_name: &str) -> Option<Self> {
        let (hidden_size, num_hidden_layers, num_attention_heads, vocab_size) = match pretrained_model_name {
            "bert-base-uncased" => (768, 12, 12, 30522),
            "bert-base-cased" => (768, 12, 12, 28996),
            "bert-large-uncased" => (1024, 24, 16, 30522),
            "bert-large-cased" => (1024, 24, 16, 28996),
            _ => return None,
        };
        Some(Self {
            vocab_size,
            hidden_size,
            num_hidden_layers,
            num_attention_heads,
            intermediate_size: 4 * hidden_size,
            max_position_embeddings: 512,
            type_vocab_size: 2,
            layer_norm_eps: default_layer_norm_eps(),
            hidden_act: default_hidden_act(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("num_attention_heads", self.num_attention_heads),
            ("intermediate_size", self.intermediate_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("type_vocab_size", self.type_vocab_size),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ExportError::invalid(format!("BertConfig: {field} must be positive")).into());
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(ExportError::invalid(format!(
                "BertConfig: hidden_size {} is not a multiple of num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            ))
            .into());
        }
        self.activation()?;
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn activation(&self) -> Result<Activation> {
        self.hidden_act.parse()
    }
}

#[derive(Debug, Clone)]
struct Embeddings {
    word: Parameter,
    position: Parameter,
    token_type: Parameter,
    norm: LayerNorm,
}

impl Embeddings {
    fn new(config: &BertConfig, init: &ParameterInit) -> Self {
        let name = format!("{PREFIX}.embeddings");
        let table = |table: &str, rows: usize| {
            init.create(format!("{name}.{table}.weight"), &[rows, config.hidden_size], Init::Normal(TRANSFORMER_INIT_STD))
        };
        Self {
            word: table("word_embeddings", config.vocab_size),
            position: table("position_embeddings", config.max_position_embeddings),
            token_type: table("token_type_embeddings", config.type_vocab_size),
            norm: LayerNorm::new(init, &format!("{name}.LayerNorm"), config.hidden_size, config.layer_norm_eps),
        }
    }

    fn trace(&self, t: &mut GraphTracer, input_ids: &Value, token_type_ids: &Value) -> Result<Value> {
        let shape = t.unary("Shape", input_ids)?;
        let one = t.constant(ConstTensor::scalar_i64(1))?;
        let seq_len = t.op("Gather", &[&shape, &one], vec![AttributeProto::int("axis", 0)])?;
        let zero = t.constant(ConstTensor::scalar_i64(0))?;
        let positions = t.op("Range", &[&zero, &seq_len, &one], Vec::new())?;

        let word = t.parameter(&self.word)?;
        let token_type = t.parameter(&self.token_type)?;
        let position = t.parameter(&self.position)?;

        let words = t.binary("Gather", &word, input_ids)?;
        let types = t.binary("Gather", &token_type, token_type_ids)?;
        let summed = t.binary("Add", &words, &types)?;
        let positional = t.binary("Gather", &position, &positions)?;
        let embedded = t.binary("Add", &summed, &positional)?;
        self.norm.trace(t, &embedded)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.word, &self.position, &self.token_type];
        params.extend(self.norm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = vec![&mut self.word, &mut self.position, &mut self.token_type];
        params.extend(self.norm.parameters_mut());
        params
    }
}

#[derive(Debug, Clone)]
struct TransformerLayer {
    query: Linear,
    key: Linear,
    value: Linear,
    attention_output: Linear,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
    activation: Activation,
}

impl TransformerLayer {
    fn new(config: &BertConfig, init: &ParameterInit, index: usize) -> Result<Self> {
        let name = format!("{PREFIX}.encoder.layer.{index}");
        let (hidden, inner, eps) = (config.hidden_size, config.intermediate_size, config.layer_norm_eps);
        let linear = |suffix: &str, in_features, out_features| Linear::new(init, &format!("{name}.{suffix}"), in_features, out_features, true);

        Ok(Self {
            query: linear("attention.self.query", hidden, hidden),
            key: linear("attention.self.key", hidden, hidden),
            value: linear("attention.self.value", hidden, hidden),
            attention_output: linear("attention.output.dense", hidden, hidden),
            attention_norm: LayerNorm::new(init, &format!("{name}.attention.output.LayerNorm"), hidden, eps),
            intermediate: linear("intermediate.dense", hidden, inner),
            output: linear("output.dense", inner, hidden),
            output_norm: LayerNorm::new(init, &format!("{name}.output.LayerNorm"), hidden, eps),
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            activation: config.activation()?,
        })
    }

    fn trace(&self, t: &mut GraphTracer, hidden: &Value, mask: &Value) -> Result<Value> {
        let query = self.query.trace(t, hidden)?;
        let key = self.key.trace(t, hidden)?;
        let key = self.split_heads(t, &key, &[0, 2, 3, 1])?;
        let value = self.value.trace(t, hidden)?;
        let value = self.split_heads(t, &value, &[0, 2, 1, 3])?;
        let query = self.split_heads(t, &query, &[0, 2, 1, 3])?;

        let scores = t.binary("MatMul", &query, &key)?;
        let scale = t.constant(ConstTensor::scalar_f32((self.head_dim as f32).sqrt()))?;
        let scores = t.binary("Div", &scores, &scale)?;
        let scores = t.binary("Add", &scores, mask)?;
        let probs = t.op("Softmax", &[&scores], vec![AttributeProto::int("axis", -1)])?;
        let context = t.binary("MatMul", &probs, &value)?;
        let context = self.merge_heads(t, &context)?;

        let attended = self.attention_output.trace(t, &context)?;
        let attended = t.binary("Add", &attended, hidden)?;
        let attended = self.attention_norm.trace(t, &attended)?;

        let inner = self.intermediate.trace(t, &attended)?;
        let inner = self.activation.trace(t, &inner)?;
        let output = self.output.trace(t, &inner)?;
        let output = t.binary("Add", &output, &attended)?;
        self.output_norm.trace(t, &output)
    }

    /// `[batch, time, hidden] -> [batch, time, heads, head_dim]`, then permuted by `perm`.
    fn split_heads(&self, t: &mut GraphTracer, x: &Value, perm: &[i64]) -> Result<Value> {
        let shape = t.unary("Shape", x)?;
        let (batch, time) = leading_dims(t, &shape)?;
        let heads = t.constant(ConstTensor::vec_i64(&[self.num_heads as i64, self.head_dim as i64]))?;
        let target = t.op("Concat", &[&batch, &time, &heads], vec![AttributeProto::int("axis", 0)])?;
        let reshaped = t.binary("Reshape", x, &target)?;
        t.op("Transpose", &[&reshaped], vec![AttributeProto::ints("perm", perm)])
    }

    /// `[batch, heads, time, head_dim] -> [batch, time, hidden]`.
    fn merge_heads(&self, t: &mut GraphTracer, context: &Value) -> Result<Value> {
        let transposed = t.op("Transpose", &[context], vec![AttributeProto::ints("perm", &[0, 2, 1, 3])])?;
        let shape = t.unary("Shape", &transposed)?;
        let (batch, time) = leading_dims(t, &shape)?;
        let hidden = t.constant(ConstTensor::vec_i64(&[(self.num_heads * self.head_dim) as i64]))?;
        let target = t.op("Concat", &[&batch, &time, &hidden], vec![AttributeProto::int("axis", 0)])?;
        t.binary("Reshape", &transposed, &target)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = Vec::new();
        for linear in [&self.query, &self.key, &self.value, &self.attention_output] {
            params.extend(linear.parameters());
        }
        params.extend(self.attention_norm.parameters());
        params.extend(self.intermediate.parameters());
        params.extend(self.output.parameters());
        params.extend(self.output_norm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = Vec::new();
        for linear in [&mut self.query, &mut self.key, &mut self.value, &mut self.attention_output] {
            params.extend(linear.parameters_mut());
        }
        params.extend(self.attention_norm.parameters_mut());
        params.extend(self.intermediate.parameters_mut());
        params.extend(self.output.parameters_mut());
        params.extend(self.output_norm.parameters_mut());
        params
    }
}

/// Batch and time extents of a `Shape` output as two 1-element vectors ready for `Concat`.
fn leading_dims(t: &mut GraphTracer, shape: &Value) -> Result<(Value, Value)> {
    let axis = || vec![AttributeProto::int("axis", 0)];
    let unsqueeze = || vec![AttributeProto::ints("axes", &[0])];

    let zero = t.constant(ConstTensor::scalar_i64(0))?;
    let batch = t.op("Gather", &[shape, &zero], axis())?;
    let one = t.constant(ConstTensor::scalar_i64(1))?;
    let time = t.op("Gather", &[shape, &one], axis())?;
    let batch = t.op("Unsqueeze", &[&batch], unsqueeze())?;
    let time = t.op("Unsqueeze", &[&time], unsqueeze())?;
    Ok((batch, time))
}

/// `(1 - mask) * -10000`, broadcastable against `[batch, heads, time, time]` scores.
fn extended_attention_mask(t: &mut GraphTracer, attention_mask: &Value) -> Result<Value> {
    let expanded = t.op("Unsqueeze", &[attention_mask], vec![AttributeProto::ints("axes", &[1, 2])])?;
    let expanded = t.op("Cast", &[&expanded], vec![AttributeProto::int("to", ElemType::Float as i64)])?;
    let one = t.constant(ConstTensor::scalar_f32(1.0))?;
    let inverted = t.binary("Sub", &one, &expanded)?;
    let bias = t.constant(ConstTensor::scalar_f32(MASKED_ATTENTION_BIAS))?;
    t.binary("Mul", &inverted, &bias)
}

/// Post-LN BERT encoder: embeddings followed by a stack of transformer layers.
#[derive(Debug, Clone)]
pub struct BertEncoder {
    config: BertConfig,
    embeddings: Embeddings,
    layers: Vec<TransformerLayer>,
}

impl BertEncoder {
    pub fn new(config: BertConfig, init: &ParameterInit) -> Result<Self> {
        config.validate()?;
        let embeddings = Embeddings::new(&config, init);
        let layers = (0..config.num_hidden_layers)
            .map(|index| TransformerLayer::new(&config, init, index))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, embeddings, layers })
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    /// Trace the encoder; returns the last hidden states `[batch, time, hidden]`.
    pub fn trace(&self, t: &mut GraphTracer, input_ids: &Value, attention_mask: &Value, token_type_ids: &Value) -> Result<Value> {
        let mask = extended_attention_mask(t, attention_mask)?;
        let mut hidden = self.embeddings.trace(t, input_ids, token_type_ids)?;
        for (index, layer) in self.layers.iter().enumerate() {
            hidden = layer.trace(t, &hidden, &mask)?;
            debug!("Traced encoder layer {index}, {} nodes so far", t.node_count());
        }
        Ok(hidden)
    }

    /// Overwrite parameters with weights from a directory of HuggingFace-named safetensors files.
    ///
    /// Names are looked up with and without the `bert.` prefix; linear weights are transposed
    /// from `[out, in]`. Returns the number of parameters loaded.
    pub fn load_pretrained(&mut self, checkpoint_dir: &Path) -> Result<usize> {
        let reader = TensorReader::new(checkpoint_dir)?;
        let mut loaded = 0;

        for param in self.parameters_mut() {
            let Some(tensor) = checkpoint_names(&param.name).iter().find_map(|name| reader.load_tensor(name).transpose()) else {
                warn!("⚠️ {} not found in checkpoint, keeping initialized values", param.name);
                continue;
            };
            let tensor = tensor.with_context(|| format!("Failed to load {}", param.name))?;

            let is_linear_weight = param.shape.len() == 2 && !param.name.contains("embeddings");
            let data = if is_linear_weight {
                let expected = [param.shape[1], param.shape[0]];
                if tensor.shape != expected {
                    anyhow::bail!("Checkpoint tensor for {} has shape {:?}, expected {:?}", param.name, tensor.shape, expected);
                }
                transpose(&tensor.data, expected[0], expected[1])
            } else {
                if tensor.shape != param.shape {
                    anyhow::bail!("Checkpoint tensor for {} has shape {:?}, expected {:?}", param.name, tensor.shape, param.shape);
                }
                tensor.data
            };
            param.data = data;
            loaded += 1;
        }

        if loaded == 0 {
            let names = reader.tensor_names()?;
            anyhow::bail!(
                "No encoder tensors found in {} ({} tensors, first: {:?})",
                checkpoint_dir.display(),
                names.len(),
                names.iter().take(3).collect::<Vec<_>>()
            );
        }

        info!("📦 Loaded {loaded} encoder tensors from {}", checkpoint_dir.display());
        Ok(loaded)
    }
}

/// Candidate checkpoint names for an encoder parameter.
fn checkpoint_names(name: &str) -> Vec<String> {
    let local = name.strip_prefix(&format!("{PREFIX}.")).unwrap_or(name);
    let mut names = vec![format!("bert.{local}"), local.to_string()];
    // older checkpoints name layer norm parameters gamma/beta
    if let Some(stem) = local.strip_suffix("LayerNorm.weight") {
        names.push(format!("bert.{stem}LayerNorm.gamma"));
    } else if let Some(stem) = local.strip_suffix("LayerNorm.bias") {
        names.push(format!("bert.{stem}LayerNorm.beta"));
    }
    names
}

/// Row-major `[rows, cols] -> [cols, rows]`.
fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0; data.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

impl Module for BertEncoder {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.embeddings.parameters();
        params.extend(self.layers.iter().flat_map(TransformerLayer::parameters));
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.embeddings.parameters_mut();
        params.extend(self.layers.iter_mut().flat_map(TransformerLayer::parameters_mut));
        params
    }
}
