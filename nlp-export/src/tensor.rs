use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use rayon::prelude::*;
use std::fmt;

use crate::device::Device;
use crate::onnx::{
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto, tensor_shape_proto, type_proto,
};

/// Element types used by exported graphs (values match ONNX `TensorProto.DataType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ElemType {
    Float = 1,
    Int32 = 6,
    Int64 = 7,
    Bool = 9,
    Double = 11,
}

impl ElemType {
    pub fn byte_size(&self) -> usize {
        match self {
            ElemType::Float | ElemType::Int32 => 4,
            ElemType::Int64 | ElemType::Double => 8,
            ElemType::Bool => 1,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self, ElemType::Int32 | ElemType::Int64)
    }
}

impl TryFrom<i32> for ElemType {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::Float),
            6 => Ok(Self::Int32),
            7 => Ok(Self::Int64),
            9 => Ok(Self::Bool),
            11 => Ok(Self::Double),
            _ => anyhow::bail!("Unsupported element type: {value}"),
        }
    }
}

/// One dimension of a traced tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dim {
    Fixed(i64),
    /// Named symbolic dimension such as `batch` or `time`.
    Param(String),
    Unknown,
}

impl Dim {
    pub fn param(name: &str) -> Self {
        Dim::Param(name.to_string())
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(value) => write!(f, "{value}"),
            Dim::Param(name) => write!(f, "{name}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Element type plus (possibly symbolic) shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    pub elem: ElemType,
    pub dims: Vec<Dim>,
}

impl TensorType {
    pub fn new(elem: ElemType, dims: Vec<Dim>) -> Self {
        Self { elem, dims }
    }

    pub fn scalar(elem: ElemType) -> Self {
        Self { elem, dims: Vec::new() }
    }

    pub fn fixed(elem: ElemType, shape: &[usize]) -> Self {
        Self { elem, dims: shape.iter().map(|&d| Dim::Fixed(d as i64)).collect() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn to_value_info(&self, name: &str) -> ValueInfoProto {
        let dim = self
            .dims
            .iter()
            .map(|d| tensor_shape_proto::Dimension {
                denotation: String::new(),
                value: match d {
                    Dim::Fixed(v) => Some(tensor_shape_proto::dimension::Value::DimValue(*v)),
                    Dim::Param(p) => Some(tensor_shape_proto::dimension::Value::DimParam(p.clone())),
                    Dim::Unknown => None,
                },
            })
            .collect();

        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                denotation: String::new(),
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: self.elem as i32,
                    shape: Some(TensorShapeProto { dim }),
                })),
            }),
            doc_string: String::new(),
        }
    }

    pub fn from_value_info(info: &ValueInfoProto) -> Result<Self> {
        let tensor = match info.r#type.as_ref().and_then(|t| t.value.as_ref()) {
            Some(type_proto::Value::TensorType(tensor)) => tensor,
            None => anyhow::bail!("Value '{}' has no tensor type", info.name),
        };
        let elem = ElemType::try_from(tensor.elem_type)?;
        let dims = tensor
            .shape
            .as_ref()
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .map(|d| match &d.value {
                        Some(tensor_shape_proto::dimension::Value::DimValue(v)) => Dim::Fixed(*v),
                        Some(tensor_shape_proto::dimension::Value::DimParam(p)) => Dim::Param(p.clone()),
                        None => Dim::Unknown,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { elem, dims })
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(|d| d.to_string()).collect();
        write!(f, "{:?}[{}]", self.elem, dims.join(", "))
    }
}

/// Small constant tensors emitted as `Constant` nodes while tracing.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstTensor {
    Float(Vec<usize>, Vec<f32>),
    Int64(Vec<usize>, Vec<i64>),
}

impl ConstTensor {
    pub fn scalar_f32(value: f32) -> Self {
        ConstTensor::Float(Vec::new(), vec![value])
    }

    pub fn scalar_i64(value: i64) -> Self {
        ConstTensor::Int64(Vec::new(), vec![value])
    }

    pub fn vec_i64(values: &[i64]) -> Self {
        ConstTensor::Int64(vec![values.len()], values.to_vec())
    }

    pub fn tensor_type(&self) -> TensorType {
        match self {
            ConstTensor::Float(shape, _) => TensorType::fixed(ElemType::Float, shape),
            ConstTensor::Int64(shape, _) => TensorType::fixed(ElemType::Int64, shape),
        }
    }

    pub fn to_proto(&self, name: &str) -> Result<TensorProto> {
        match self {
            ConstTensor::Float(shape, values) => encode_f32(name, shape, values),
            ConstTensor::Int64(shape, values) => {
                let mut raw_data = Vec::with_capacity(values.len() * 8);
                values.iter().try_for_each(|&v| raw_data.write_i64::<LittleEndian>(v))?;
                Ok(TensorProto {
                    dims: shape.iter().map(|&d| d as i64).collect(),
                    data_type: ElemType::Int64 as i32,
                    name: name.to_string(),
                    raw_data,
                    ..Default::default()
                })
            }
        }
    }
}

fn encode_f32(name: &str, shape: &[usize], values: &[f32]) -> Result<TensorProto> {
    let mut raw_data = Vec::with_capacity(values.len() * 4);
    values.iter().try_for_each(|&v| raw_data.write_f32::<LittleEndian>(v))?;
    Ok(TensorProto {
        dims: shape.iter().map(|&d| d as i64).collect(),
        data_type: ElemType::Float as i32,
        name: name.to_string(),
        raw_data,
        ..Default::default()
    })
}

/// A trainable tensor owned by a module.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
    pub device: Device,
}

impl Parameter {
    pub fn from_data(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            anyhow::bail!("Parameter '{name}' expects {expected} values for shape {shape:?}, got {}", data.len());
        }
        Ok(Self { name, shape, data, device: Device::Cpu })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn tensor_type(&self) -> TensorType {
        TensorType::fixed(ElemType::Float, &self.shape)
    }

    pub fn to_proto(&self) -> Result<TensorProto> {
        encode_f32(&self.name, &self.shape, &self.data)
    }
}

/// How a parameter is filled when it is created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// Normal distribution with the given standard deviation (transformer init).
    Normal(f32),
    /// Uniform in `[-bound, bound]`.
    Uniform(f32),
    Zeros,
    Ones,
}

/// Deterministic parameter factory.
///
/// Values are generated in fixed-size chunks filled in parallel. Every chunk draws from its own
/// xorshift stream seeded from the base seed, the parameter name and the chunk index, so the
/// result never depends on thread scheduling.
#[derive(Debug, Clone)]
pub struct ParameterInit {
    seed: u64,
}

impl ParameterInit {
    pub const DEFAULT_SEED: u64 = 42;
    const CHUNK_SIZE: usize = 1 << 16;

    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn create(&self, name: impl Into<String>, shape: &[usize], init: Init) -> Parameter {
        let name = name.into();
        let numel = shape.iter().product::<usize>();
        let stream = self.seed ^ name_hash(&name);

        let data = match init {
            Init::Zeros => vec![0.0; numel],
            Init::Ones => vec![1.0; numel],
            Init::Normal(_) | Init::Uniform(_) => {
                let mut data = vec![0.0f32; numel];
                data.par_chunks_mut(Self::CHUNK_SIZE).enumerate().for_each(|(chunk_idx, chunk)| {
                    let mut rng = XorShift::new(stream ^ (chunk_idx as u64).wrapping_mul(0x9E3779B97F4A7C15));
                    for value in chunk.iter_mut() {
                        *value = match init {
                            Init::Normal(std) => rng.next_normal() * std,
                            Init::Uniform(bound) => (rng.next_f32() * 2.0 - 1.0) * bound,
                            Init::Zeros | Init::Ones => unreachable!("constant fills are handled above"),
                        };
                    }
                });
                data
            }
        };

        Parameter { name, shape: shape.to_vec(), data, device: Device::Cpu }
    }
}

impl Default for ParameterInit {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SEED)
    }
}

/// FNV-1a over the parameter name.
fn name_hash(name: &str) -> u64 {
    name.bytes()
        .fold(0xcbf29ce484222325u64, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(0x100000001b3))
}

#[derive(Debug)]
struct XorShift {
    state: u64,
}

impl XorShift {
    fn new(seed: u64) -> Self {
        // a zero state never leaves zero
        Self { state: if seed == 0 { 0x9E3779B97F4A7C15 } else { seed } }
    }

    fn next_u32(&mut self) -> u32 {
        self.state ^= self.state >> 12;
        self.state ^= self.state << 25;
        self.state ^= self.state >> 27;
        ((self.state.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    /// Uniform in [0, 1).
    fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / 16777216.0
    }

    /// Standard normal via Box-Muller.
    fn next_normal(&mut self) -> f32 {
        let u1 = self.next_f32().max(f32::MIN_POSITIVE);
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
    }
}
