use std::fmt;
use std::str::FromStr;

/// Execution device a module's parameters are placed on.
///
/// Tracing is symbolic, so the device is a placement tag: it is recorded in the exported
/// model metadata and every parameter must agree on it before a graph is traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(u32),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(ordinal) => write!(f, "accelerator:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    /// Accepts `cpu`, `accelerator[:N]`, and the `cuda[:N]` / `gpu[:N]` aliases.
    fn from_str(value: &str) -> anyhow::Result<Self> {
        let value = value.trim().to_ascii_lowercase();
        let (kind, ordinal) = match value.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (value.as_str(), None),
        };

        match (kind, ordinal) {
            ("cpu", None) => Ok(Device::Cpu),
            ("accelerator" | "cuda" | "gpu", None) => Ok(Device::Accelerator(0)),
            ("accelerator" | "cuda" | "gpu", Some(ordinal)) => {
                let ordinal = ordinal
                    .parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("Invalid device ordinal in '{value}'"))?;
                Ok(Device::Accelerator(ordinal))
            }
            _ => anyhow::bail!("Unknown device: '{value}'"),
        }
    }
}
