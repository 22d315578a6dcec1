use anyhow::{Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use memmap2::Mmap;
use safetensors::SafeTensors;
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    mem,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// A checkpoint tensor converted to `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Memory-mapped reader over a directory of SafeTensors files
#[derive(Debug)]
pub struct TensorReader {
    safetensors_files: Vec<PathBuf>,
    mmap_cache: Arc<Mutex<MmapCache>>, // LRU cache for memory mappings
}

impl TensorReader {
    pub fn new(checkpoint_dir: &Path) -> Result<Self> {
        let mut safetensors_files = std::fs::read_dir(checkpoint_dir)
            .with_context(|| format!("Failed to read directory: {}", checkpoint_dir.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == "safetensors").then_some(path)
            })
            .collect::<Vec<_>>();

        if safetensors_files.is_empty() {
            anyhow::bail!("No SafeTensors files found in {}", checkpoint_dir.display());
        }
        // shard order decides which file wins on duplicate names
        safetensors_files.sort();

        info!("Found {} safetensor files", safetensors_files.len());

        Ok(TensorReader {
            safetensors_files,
            mmap_cache: Arc::new(Mutex::new(MmapCache::new(10))),
        })
    }

    /// Load a tensor by name, converting BF16/F32 data to F32.
    ///
    /// Returns `Ok(None)` when no file holds the tensor.
    pub fn load_tensor(&self, tensor_name: &str) -> Result<Option<LoadedTensor>> {
        for filename in &self.safetensors_files {
            let mmap = self.get_mmap(filename)?;
            let safetensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("Failed to deserialize {}", filename.display()))?;

            if let Ok(tensor_view) = safetensors.tensor(tensor_name) {
                let data = Self::convert_tensor_to_f32(&tensor_view, tensor_name)?;
                return Ok(Some(LoadedTensor { shape: tensor_view.shape().to_vec(), data }));
            }
        }
        Ok(None)
    }

    /// All tensor names across the checkpoint files, sorted.
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for filename in &self.safetensors_files {
            let mmap = self.get_mmap(filename)?;
            let safetensors = SafeTensors::deserialize(&mmap)
                .with_context(|| format!("Failed to deserialize {}", filename.display()))?;
            names.extend(safetensors.names().into_iter().cloned());
        }
        names.sort();
        Ok(names)
    }

    fn convert_tensor_to_f32(tensor_view: &safetensors::tensor::TensorView, tensor_name: &str) -> Result<Vec<f32>> {
        let tensor_data = tensor_view.data();
        let expected_elements = tensor_view.shape().iter().product::<usize>();

        match tensor_view.dtype() {
            safetensors::Dtype::F32 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * mem::size_of::<f32>(), tensor_name, "F32")?;
                let mut data = vec![0.0f32; expected_elements];
                LittleEndian::read_f32_into(tensor_data, &mut data);
                Ok(data)
            }
            safetensors::Dtype::BF16 => {
                Self::validate_tensor_size(tensor_data.len(), expected_elements * 2, tensor_name, "BF16")?;
                // BF16 is the upper half of an F32
                Ok(tensor_data
                    .chunks_exact(2)
                    .map(|chunk| f32::from_bits(u32::from(LittleEndian::read_u16(chunk)) << 16))
                    .collect())
            }
            dtype => anyhow::bail!("Unsupported tensor dtype {:?} for {}", dtype, tensor_name),
        }
    }

    fn validate_tensor_size(actual_bytes: usize, expected_bytes: usize, tensor_name: &str, dtype_name: &str) -> Result<()> {
        if actual_bytes != expected_bytes {
            anyhow::bail!(
                "{} tensor {} size mismatch. Expected {} bytes, got {}",
                dtype_name,
                tensor_name,
                expected_bytes,
                actual_bytes
            );
        }
        Ok(())
    }

    /// Get or create a cached memory mapping for a file
    fn get_mmap(&self, path: &Path) -> Result<Arc<Mmap>> {
        let mut cache = self.mmap_cache.lock().map_err(|_| anyhow::anyhow!("Failed to acquire cache lock"))?;

        if let Some(cached_mmap) = cache.get(path) {
            return Ok(cached_mmap);
        }

        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

        // SAFETY: file-backed maps are UB if the file is modified while mapped; checkpoints are
        // treated as read-only for the lifetime of the reader.
        let mmap = Arc::new(unsafe { Mmap::map(&file) }.with_context(|| format!("Failed to memory map {}", path.display()))?);

        cache.insert(path.to_path_buf(), Arc::clone(&mmap));
        Ok(mmap)
    }
}

/// LRU cache of memory mappings
#[derive(Debug)]
struct MmapCache {
    cache: HashMap<PathBuf, Arc<Mmap>>,
    access_order: VecDeque<PathBuf>,
    max_size: usize,
}

impl MmapCache {
    fn new(max_size: usize) -> Self {
        Self { cache: HashMap::new(), access_order: VecDeque::new(), max_size }
    }

    fn get(&mut self, path: &Path) -> Option<Arc<Mmap>> {
        let mmap = Arc::clone(self.cache.get(path)?);
        if let Some(pos) = self.access_order.iter().position(|p| p == path) {
            self.access_order.remove(pos);
        }
        self.access_order.push_front(path.to_path_buf());
        Some(mmap)
    }

    fn insert(&mut self, path: PathBuf, mmap: Arc<Mmap>) {
        if self.cache.contains_key(&path) {
            if let Some(pos) = self.access_order.iter().position(|p| p == &path) {
                self.access_order.remove(pos);
            }
        }

        while self.cache.len() >= self.max_size {
            match self.access_order.pop_back() {
                Some(lru_path) => {
                    self.cache.remove(&lru_path);
                }
                None => break,
            }
        }

        self.cache.insert(path.clone(), mmap);
        self.access_order.push_front(path);
    }
}
