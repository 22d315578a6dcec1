use anyhow::Result;
use log::info;

use super::bert::BertEncoder;
use super::classifiers::{SequenceTokenClassifier, SequenceTokenClassifierConfig, select_token};
use super::layers::Activation;
use super::{Exportable, Module};
use crate::config_loader::{IntentSlotConfig, IntentSlotModelConfig, Trainer, load_class_labels};
use crate::error::ExportError;
use crate::tensor::{Dim, ElemType, Parameter, ParameterInit, TensorType};
use crate::tracer::{GraphTracer, Value};

/// Node-name prefix of the joint classifier inside the exported graph.
const CLASSIFIER_SCOPE: &str = "ISC";

/// BERT encoder followed by a joint intent (sequence) and slot (token) classifier.
#[derive(Debug, Clone)]
pub struct IntentSlotClassificationModel {
    encoder: BertEncoder,
    classifier: SequenceTokenClassifier,
    intent_labels: Vec<String>,
    slot_labels: Vec<String>,
    max_seq_length: usize,
    precision: u32,
}

impl IntentSlotClassificationModel {
    pub fn new(config: &IntentSlotModelConfig, trainer: &Trainer) -> Result<Self> {
        let (intent_labels, slot_labels) = load_class_labels(config.data_dir()?)?;

        let language_model = &config.language_model;
        let encoder_config = language_model.resolve_encoder_config()?;
        if language_model.max_seq_length == 0 || language_model.max_seq_length > encoder_config.max_position_embeddings {
            return Err(ExportError::invalid(format!(
                "language_model.max_seq_length {} must be in 1..={}",
                language_model.max_seq_length, encoder_config.max_position_embeddings
            ))
            .into());
        }

        let init = ParameterInit::default();
        let mut encoder = BertEncoder::new(encoder_config, &init)?;
        if let Some(checkpoint_dir) = language_model.checkpoint_dir() {
            encoder.load_pretrained(checkpoint_dir)?;
        }

        let classifier_config = SequenceTokenClassifierConfig {
            hidden_size: encoder.config().hidden_size,
            num_intents: intent_labels.len(),
            num_slots: slot_labels.len(),
            num_layers: config.head.num_output_layers,
            activation: Activation::Relu,
            log_softmax: false,
            dropout: config.head.fc_dropout,
            use_transformer_init: true,
        };
        let classifier = SequenceTokenClassifier::with_init(classifier_config, &init, "classifier")?;

        let model = Self {
            encoder,
            classifier,
            intent_labels,
            slot_labels,
            max_seq_length: language_model.max_seq_length,
            precision: trainer.precision(),
        }
        .to(trainer.device());

        info!(
            "🧩 Built {} with {} parameters on {}",
            model.class_name(),
            model.num_parameters(),
            trainer.device()
        );
        Ok(model)
    }

    /// Build the trainer and the model from a full configuration.
    pub fn from_config(config: &IntentSlotConfig) -> Result<Self> {
        let trainer = Trainer::new(config.trainer.clone())?;
        Self::new(&config.model, &trainer)
    }

    pub fn encoder(&self) -> &BertEncoder {
        &self.encoder
    }

    pub fn intent_labels(&self) -> &[String] {
        &self.intent_labels
    }

    pub fn slot_labels(&self) -> &[String] {
        &self.slot_labels
    }

    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }
}

impl Module for IntentSlotClassificationModel {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.encoder.parameters();
        params.extend(self.classifier.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.encoder.parameters_mut();
        params.extend(self.classifier.parameters_mut());
        params
    }
}

impl Exportable for IntentSlotClassificationModel {
    fn class_name(&self) -> &'static str {
        "IntentSlotClassificationModel"
    }

    fn input_types(&self) -> Vec<(&'static str, TensorType)> {
        let token_ids = || TensorType::new(ElemType::Int64, vec![Dim::param("batch"), Dim::param("time")]);
        vec![("input_ids", token_ids()), ("attention_mask", token_ids()), ("token_type_ids", token_ids())]
    }

    fn output_names(&self) -> Vec<&'static str> {
        vec!["intent_logits", "slot_logits"]
    }

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>> {
        let [input_ids, attention_mask, token_type_ids] = inputs else {
            anyhow::bail!("{} expects 3 inputs, got {}", self.class_name(), inputs.len());
        };

        let hidden_states = self.encoder.trace(t, input_ids, attention_mask, token_type_ids)?;
        let pooled = select_token(t, &hidden_states, 0)?;

        t.push_scope(CLASSIFIER_SCOPE);
        let logits = self.classifier.classify(t, &pooled, &hidden_states);
        t.pop_scope();

        let (intent_logits, slot_logits) = logits?;
        Ok(vec![intent_logits, slot_logits])
    }

    fn precision_bits(&self) -> u32 {
        self.precision
    }
}
