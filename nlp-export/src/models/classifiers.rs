#[cfg(test)]
#[path = "../../tests/unit/classifiers_test.rs"]
mod classifiers_test;

use anyhow::Result;

use super::layers::{Activation, LayerNorm, Linear, MultiLayerPerceptron};
use super::{Exportable, Module};
use crate::error::ExportError;
use crate::onnx::AttributeProto;
use crate::tensor::{ConstTensor, Dim, ElemType, Parameter, ParameterInit, TensorType};
use crate::tracer::{GraphTracer, Value};

const HIDDEN_STATES: &str = "hidden_states";

/// Hyperparameters shared by the single-output classifier heads.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    pub hidden_size: usize,
    pub num_classes: usize,
    pub num_layers: usize,
    pub activation: Activation,
    pub log_softmax: bool,
    /// Training-time dropout; graphs are traced in inference mode and do not contain it.
    pub dropout: f32,
    pub use_transformer_init: bool,
    /// Token whose hidden state feeds sequence-level heads.
    pub idx_conditioned_on: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_classes: 2,
            num_layers: 2,
            activation: Activation::Relu,
            log_softmax: true,
            dropout: 0.0,
            use_transformer_init: true,
            idx_conditioned_on: 0,
        }
    }
}

impl ClassifierConfig {
    fn validate(&self, class_name: &str) -> Result<()> {
        validate_common(class_name, self.hidden_size, self.num_layers, self.dropout)?;
        if self.num_classes == 0 {
            return Err(ExportError::invalid(format!("{class_name}: num_classes must be positive")).into());
        }
        Ok(())
    }
}

fn validate_common(class_name: &str, hidden_size: usize, num_layers: usize, dropout: f32) -> Result<()> {
    if hidden_size == 0 {
        return Err(ExportError::invalid(format!("{class_name}: hidden_size must be positive")).into());
    }
    if num_layers == 0 {
        return Err(ExportError::invalid(format!("{class_name}: num_layers must be at least 1")).into());
    }
    if !(0.0..1.0).contains(&dropout) {
        return Err(ExportError::invalid(format!("{class_name}: dropout must be in [0, 1), got {dropout}")).into());
    }
    Ok(())
}

fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() { name.to_string() } else { format!("{prefix}.{name}") }
}

fn hidden_states_input(hidden_size: usize) -> Vec<(&'static str, TensorType)> {
    let dims = vec![Dim::param("batch"), Dim::param("time"), Dim::Fixed(hidden_size as i64)];
    vec![(HIDDEN_STATES, TensorType::new(ElemType::Float, dims))]
}

fn single_input<'a>(inputs: &'a [Value], class_name: &str) -> Result<&'a Value> {
    match inputs {
        [hidden_states] => Ok(hidden_states),
        _ => anyhow::bail!("{class_name} expects exactly one input, got {}", inputs.len()),
    }
}

/// Pick the hidden state of token `idx`: `[batch, time, hidden] -> [batch, hidden]`.
pub(crate) fn select_token(t: &mut GraphTracer, hidden_states: &Value, idx: usize) -> Result<Value> {
    let index = t.constant(ConstTensor::scalar_i64(idx as i64))?;
    t.op("Gather", &[hidden_states, &index], vec![AttributeProto::int("axis", 1)])
}

/// Per-token classifier: an MLP applied to every position.
#[derive(Debug, Clone)]
pub struct TokenClassifier {
    config: ClassifierConfig,
    mlp: MultiLayerPerceptron,
}

impl TokenClassifier {
    /// Single linear layer with log-softmax.
    pub fn default_config(hidden_size: usize, num_classes: usize) -> ClassifierConfig {
        ClassifierConfig { hidden_size, num_classes, num_layers: 1, ..Default::default() }
    }

    pub fn new(config: ClassifierConfig) -> Result<Self> {
        Self::with_init(config, &ParameterInit::default(), "")
    }

    pub fn with_init(config: ClassifierConfig, init: &ParameterInit, prefix: &str) -> Result<Self> {
        config.validate("TokenClassifier")?;
        let mlp = MultiLayerPerceptron::new(
            init,
            &scoped(prefix, "mlp"),
            config.hidden_size,
            config.num_classes,
            config.num_layers,
            config.activation,
            config.log_softmax,
            config.use_transformer_init,
        );
        Ok(Self { config, mlp })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }
}

impl Module for TokenClassifier {
    fn parameters(&self) -> Vec<&Parameter> {
        self.mlp.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.mlp.parameters_mut()
    }
}

impl Exportable for TokenClassifier {
    fn class_name(&self) -> &'static str {
        "TokenClassifier"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        hidden_states_input(self.config.hidden_size)
    }

    fn output_names(&self) -> Vec<&'static str> {
        vec!["logits"]
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let hidden_states = single_input(inputs, self.class_name())?;
        Ok(vec![self.mlp.trace(t, hidden_states)?])
    }
}

/// Masked-language-model head: dense transform, activation and layer norm, then an MLP.
#[derive(Debug, Clone)]
pub struct BertPretrainingTokenClassifier {
    config: ClassifierConfig,
    dense: Linear,
    norm: LayerNorm,
    mlp: MultiLayerPerceptron,
}

impl BertPretrainingTokenClassifier {
    pub const LAYER_NORM_EPS: f32 = 1e-12;

    pub fn new(config: ClassifierConfig) -> Result<Self> {
        Self::with_init(config, &ParameterInit::default(), "")
    }

    pub fn with_init(config: ClassifierConfig, init: &ParameterInit, prefix: &str) -> Result<Self> {
        config.validate("BertPretrainingTokenClassifier")?;
        let hidden = config.hidden_size;
        Ok(Self {
            dense: Linear::new(init, &scoped(prefix, "dense"), hidden, hidden, config.use_transformer_init),
            norm: LayerNorm::new(init, &scoped(prefix, "norm"), hidden, Self::LAYER_NORM_EPS),
            mlp: MultiLayerPerceptron::new(
                init,
                &scoped(prefix, "mlp"),
                hidden,
                config.num_classes,
                config.num_layers,
                config.activation,
                config.log_softmax,
                config.use_transformer_init,
            ),
            config,
        })
    }
}

impl Module for BertPretrainingTokenClassifier {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.dense.parameters();
        params.extend(self.norm.parameters());
        params.extend(self.mlp.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.dense.parameters_mut();
        params.extend(self.norm.parameters_mut());
        params.extend(self.mlp.parameters_mut());
        params
    }
}

impl Exportable for BertPretrainingTokenClassifier {
    fn class_name(&self) -> &'static str {
        "BertPretrainingTokenClassifier"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        hidden_states_input(self.config.hidden_size)
    }

    fn output_names(&self) -> Vec<&'static str> {
        vec!["logits"]
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let hidden_states = single_input(inputs, self.class_name())?;
        let transformed = self.dense.trace(t, hidden_states)?;
        let activated = self.config.activation.trace(t, &transformed)?;
        let normalized = self.norm.trace(t, &activated)?;
        Ok(vec![self.mlp.trace(t, &normalized)?])
    }
}

/// Sequence-level classifier conditioned on one token's hidden state.
#[derive(Debug, Clone)]
pub struct SequenceClassifier {
    config: ClassifierConfig,
    mlp: MultiLayerPerceptron,
}

impl SequenceClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        Self::with_init(config, &ParameterInit::default(), "")
    }

    pub fn with_init(config: ClassifierConfig, init: &ParameterInit, prefix: &str) -> Result<Self> {
        config.validate("SequenceClassifier")?;
        let mlp = MultiLayerPerceptron::new(
            init,
            &scoped(prefix, "mlp"),
            config.hidden_size,
            config.num_classes,
            config.num_layers,
            config.activation,
            config.log_softmax,
            config.use_transformer_init,
        );
        Ok(Self { config, mlp })
    }
}

impl Module for SequenceClassifier {
    fn parameters(&self) -> Vec<&Parameter> {
        self.mlp.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.mlp.parameters_mut()
    }
}

impl Exportable for SequenceClassifier {
    fn class_name(&self) -> &'static str {
        "SequenceClassifier"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        hidden_states_input(self.config.hidden_size)
    }

    fn output_names(&self) -> Vec<&'static str> {
        vec!["logits"]
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let hidden_states = single_input(inputs, self.class_name())?;
        let token = select_token(t, hidden_states, self.config.idx_conditioned_on)?;
        Ok(vec![self.mlp.trace(t, &token)?])
    }
}

/// Sequence-level regression head producing one value per sequence.
///
/// `num_classes` and `log_softmax` of the config are ignored: the head always has a single,
/// unnormalized output.
#[derive(Debug, Clone)]
pub struct SequenceRegression {
    config: ClassifierConfig,
    mlp: MultiLayerPerceptron,
}

impl SequenceRegression {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        Self::with_init(config, &ParameterInit::default(), "")
    }

    pub fn with_init(config: ClassifierConfig, init: &ParameterInit, prefix: &str) -> Result<Self> {
        let config = ClassifierConfig { num_classes: 1, log_softmax: false, ..config };
        config.validate("SequenceRegression")?;
        let mlp = MultiLayerPerceptron::new(
            init,
            &scoped(prefix, "mlp"),
            config.hidden_size,
            1,
            config.num_layers,
            config.activation,
            false,
            config.use_transformer_init,
        );
        Ok(Self { config, mlp })
    }
}

impl Module for SequenceRegression {
    fn parameters(&self) -> Vec<&Parameter> {
        self.mlp.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.mlp.parameters_mut()
    }
}

impl Exportable for SequenceRegression {
    fn class_name(&self) -> &'static str {
        "SequenceRegression"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        hidden_states_input(self.config.hidden_size)
    }

    fn output_names(&self) -> Vec<&'static str> {
        vec!["preds"]
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let hidden_states = single_input(inputs, self.class_name())?;
        let token = select_token(t, hidden_states, self.config.idx_conditioned_on)?;
        let preds = self.mlp.trace(t, &token)?;
        Ok(vec![t.op("Squeeze", &[&preds], vec![AttributeProto::ints("axes", &[-1])])?])
    }
}

/// Hyperparameters of the joint intent (sequence) and slot (token) classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceTokenClassifierConfig {
    pub hidden_size: usize,
    pub num_intents: usize,
    pub num_slots: usize,
    pub num_layers: usize,
    pub activation: Activation,
    pub log_softmax: bool,
    pub dropout: f32,
    pub use_transformer_init: bool,
}

impl Default for SequenceTokenClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            num_intents: 2,
            num_slots: 2,
            num_layers: 2,
            activation: Activation::Relu,
            log_softmax: false,
            dropout: 0.0,
            use_transformer_init: true,
        }
    }
}

/// Joint head: intent logits from the first token, slot logits for every token.
#[derive(Debug, Clone)]
pub struct SequenceTokenClassifier {
    config: SequenceTokenClassifierConfig,
    intent_mlp: MultiLayerPerceptron,
    slot_mlp: MultiLayerPerceptron,
}

impl SequenceTokenClassifier {
    pub fn new(config: SequenceTokenClassifierConfig) -> Result<Self> {
        Self::with_init(config, &ParameterInit::default(), "")
    }

    pub fn with_init(config: SequenceTokenClassifierConfig, init: &ParameterInit, prefix: &str) -> Result<Self> {
        let class_name = "SequenceTokenClassifier";
        validate_common(class_name, config.hidden_size, config.num_layers, config.dropout)?;
        if config.num_intents == 0 || config.num_slots == 0 {
            return Err(ExportError::invalid(format!("{class_name}: num_intents and num_slots must be positive")).into());
        }

        let mlp = |name: &str, num_classes: usize| {
            MultiLayerPerceptron::new(
                init,
                &scoped(prefix, name),
                config.hidden_size,
                num_classes,
                config.num_layers,
                config.activation,
                config.log_softmax,
                config.use_transformer_init,
            )
        };
        let intent_mlp = mlp("intent_mlp", config.num_intents);
        let slot_mlp = mlp("slot_mlp", config.num_slots);
        Ok(Self { config, intent_mlp, slot_mlp })
    }

    pub fn config(&self) -> &SequenceTokenClassifierConfig {
        &self.config
    }

    /// Trace both heads given the pooled first-token state and the full hidden states.
    pub fn classify(&self, t: &mut GraphTracer, pooled: &Value, hidden_states: &Value) -> Result<(Value, Value)> {
        let intent_logits = self.intent_mlp.trace(t, pooled)?;
        let slot_logits = self.slot_mlp.trace(t, hidden_states)?;
        Ok((intent_logits, slot_logits))
    }
}

impl Module for SequenceTokenClassifier {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.intent_mlp.parameters();
        params.extend(self.slot_mlp.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.intent_mlp.parameters_mut();
        params.extend(self.slot_mlp.parameters_mut());
        params
    }
}

impl Exportable for SequenceTokenClassifier {
    fn class_name(&self) -> &'static str {
        "SequenceTokenClassifier"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        hidden_states_input(self.config.hidden_size)
    }

    fn output_names(&self) -> Vec<&'static str> {
        vec!["intent_logits", "slot_logits"]
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let hidden_states = single_input(inputs, self.class_name())?;
        let pooled = select_token(t, hidden_states, 0)?;
        let (intent_logits, slot_logits) = self.classify(t, &pooled, hidden_states)?;
        Ok(vec![intent_logits, slot_logits])
    }
}
