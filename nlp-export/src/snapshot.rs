#[cfg(test)]
#[path = "../tests/unit/snapshot_test.rs"]
mod snapshot_test;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::onnx::{GraphProto, ModelProto};

/// Environment variable that makes [`bless_or_verify`] rewrite manifests instead of comparing.
pub const BLESS_ENV: &str = "BLESS_SNAPSHOTS";

/// Every difference between a golden manifest and a graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Graph does not match its golden manifest:\n  {}", .differences.join("\n  "))]
pub struct SnapshotMismatch {
    pub differences: Vec<String>,
}

/// Pinned structure of an exported graph: node count, selected node names and endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphManifest {
    pub node_count: usize,
    /// Node index to expected node name.
    pub nodes: BTreeMap<usize, String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

fn graph_of(model: &ModelProto) -> Result<&GraphProto> {
    model.graph.as_ref().context("Model has no graph")
}

impl GraphManifest {
    /// Record the structure of `model`, pinning the names of the nodes at `pins`.
    pub fn capture(model: &ModelProto, pins: &[usize]) -> Result<Self> {
        let graph = graph_of(model)?;
        let nodes = pins
            .iter()
            .map(|&index| match graph.node.get(index) {
                Some(node) => Ok((index, node.name.clone())),
                None => anyhow::bail!("Cannot pin node {index}, graph has {} nodes", graph.node.len()),
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self {
            node_count: graph.node.len(),
            nodes,
            inputs: graph.input.iter().map(|input| input.name.clone()).collect(),
            outputs: graph.output.iter().map(|output| output.name.clone()).collect(),
        })
    }

    pub fn pins(&self) -> Vec<usize> {
        self.nodes.keys().copied().collect()
    }

    /// Compare `model` against the manifest, reporting all differences at once.
    pub fn verify(&self, model: &ModelProto) -> Result<()> {
        let graph = graph_of(model)?;
        let mut differences = Vec::new();

        if graph.node.len() != self.node_count {
            differences.push(format!("node count: expected {}, got {}", self.node_count, graph.node.len()));
        }
        for (&index, expected) in &self.nodes {
            match graph.node.get(index) {
                Some(node) if node.name == *expected => {}
                Some(node) => differences.push(format!("node[{index}]: expected '{expected}', got '{}'", node.name)),
                None => differences.push(format!("node[{index}]: expected '{expected}', graph has no such node")),
            }
        }

        let inputs: Vec<&str> = graph.input.iter().map(|input| input.name.as_str()).collect();
        if inputs != self.inputs {
            differences.push(format!("inputs: expected {:?}, got {inputs:?}", self.inputs));
        }
        let outputs: Vec<&str> = graph.output.iter().map(|output| output.name.as_str()).collect();
        if outputs != self.outputs {
            differences.push(format!("outputs: expected {:?}, got {outputs:?}", self.outputs));
        }

        if differences.is_empty() { Ok(()) } else { Err(SnapshotMismatch { differences }.into()) }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Failed to open manifest {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("Failed to parse manifest {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create manifest {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Verify `model` against the manifest at `path`, or rewrite it when [`BLESS_ENV`] is set.
///
/// Blessing keeps the pinned indices of an existing manifest; a new manifest pins the first
/// and the last node.
pub fn bless_or_verify(path: &Path, model: &ModelProto) -> Result<()> {
    if std::env::var_os(BLESS_ENV).is_none() {
        return GraphManifest::load(path)?.verify(model);
    }

    let pins = if path.exists() {
        GraphManifest::load(path)?.pins()
    } else {
        let node_count = graph_of(model)?.node.len();
        [0, node_count.saturating_sub(1)].into_iter().take(node_count.min(2)).collect()
    };
    GraphManifest::capture(model, &pins)?.save(path)?;
    info!("✍️ Blessed {}", path.display());
    Ok(())
}
