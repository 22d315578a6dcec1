use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::device::Device;
use crate::error::ExportError;
use crate::model_exporter::{ExportSummary, OnnxExporter};
use crate::tensor::{Parameter, TensorType};
use crate::tracer::{GraphTracer, Value};

mod bert;
mod classifiers;
mod intent_slot;
mod layers;

pub use bert::{BertConfig, BertEncoder};
pub use classifiers::{
    BertPretrainingTokenClassifier, ClassifierConfig, SequenceClassifier, SequenceRegression,
    SequenceTokenClassifier, SequenceTokenClassifierConfig, TokenClassifier,
};
pub use intent_slot::IntentSlotClassificationModel;
pub use layers::{Activation, LayerNorm, Linear, MultiLayerPerceptron, TRANSFORMER_INIT_STD, gelu};

/// A module owning named parameters placed on a device.
pub trait Module {
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    /// Move every parameter to `device`.
    fn to_device(&mut self, device: Device) {
        self.parameters_mut().into_iter().for_each(|param| param.device = device);
    }

    /// Builder-style [`Module::to_device`].
    fn to(mut self, device: Device) -> Self
    where
        Self: Sized,
    {
        self.to_device(device);
        self
    }

    /// The device shared by all parameters; a module without parameters lives on the CPU.
    fn device(&self) -> Result<Device> {
        let params = self.parameters();
        let Some(first) = params.first() else {
            return Ok(Device::Cpu);
        };
        match params.iter().find(|param| param.device != first.device) {
            Some(stray) => Err(ExportError::DeviceMismatch {
                name: stray.name.clone(),
                expected: first.device,
                actual: stray.device,
            }
            .into()),
            None => Ok(first.device),
        }
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|param| param.numel()).sum()
    }
}

/// A module that can describe its inference-mode forward pass to a [`GraphTracer`].
pub trait Exportable: Module {
    /// Name used for the exported graph and default file name.
    fn class_name(&self) -> &'static str;

    /// Ordered graph inputs.
    fn input_types(&self) -> Vec<(&'static str, TensorType)>;

    /// Ordered graph output names; `forward` returns values in the same order.
    fn output_names(&self) -> Vec<&'static str>;

    fn forward(&self, t: &mut GraphTracer, inputs: &[Value]) -> Result<Vec<Value>>;

    /// Float width of the parameters the graph is exported with.
    fn precision_bits(&self) -> u32 {
        32
    }

    /// Export with the default exporter settings (graph check enabled).
    fn export(&self, output: &Path) -> Result<ExportSummary> {
        OnnxExporter::default().export(self, output)
    }
}

/// The standalone classifier heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadKind {
    Token,
    BertPretrainingToken,
    Sequence,
    SequenceRegression,
    SequenceToken,
}

impl HeadKind {
    pub const ALL: [HeadKind; 5] = [
        HeadKind::Token,
        HeadKind::BertPretrainingToken,
        HeadKind::Sequence,
        HeadKind::SequenceRegression,
        HeadKind::SequenceToken,
    ];

    pub fn class_name(&self) -> &'static str {
        match self {
            HeadKind::Token => "TokenClassifier",
            HeadKind::BertPretrainingToken => "BertPretrainingTokenClassifier",
            HeadKind::Sequence => "SequenceClassifier",
            HeadKind::SequenceRegression => "SequenceRegression",
            HeadKind::SequenceToken => "SequenceTokenClassifier",
        }
    }
}

impl fmt::Display for HeadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name())
    }
}

impl FromStr for HeadKind {
    type Err = anyhow::Error;

    /// Accepts the class name in any case.
    fn from_str(value: &str) -> Result<Self> {
        HeadKind::ALL
            .into_iter()
            .find(|kind| kind.class_name().eq_ignore_ascii_case(value))
            .ok_or_else(|| ExportError::invalid(format!("unknown head '{value}'")).into())
    }
}

/// Build a head with default hyperparameters apart from the given sizes.
///
/// The joint sequence/token head splits `num_classes` evenly between intents and slots.
pub fn build_head(kind: HeadKind, hidden_size: usize, num_layers: usize, num_classes: usize) -> Result<Box<dyn Exportable>> {
    let config = ClassifierConfig { hidden_size, num_classes, num_layers, ..Default::default() };
    let head: Box<dyn Exportable> = match kind {
        HeadKind::Token => Box::new(TokenClassifier::new(config)?),
        HeadKind::BertPretrainingToken => Box::new(BertPretrainingTokenClassifier::new(config)?),
        HeadKind::Sequence => Box::new(SequenceClassifier::new(config)?),
        HeadKind::SequenceRegression => Box::new(SequenceRegression::new(config)?),
        HeadKind::SequenceToken => {
            let num_intents = num_classes / 2;
            Box::new(SequenceTokenClassifier::new(SequenceTokenClassifierConfig {
                hidden_size,
                num_intents,
                num_slots: num_classes - num_intents,
                num_layers,
                ..Default::default()
            })?)
        }
    };
    Ok(head)
}
