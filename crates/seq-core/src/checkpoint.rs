use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use memmap2::MmapOptions;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use tch::{nn, Device, Kind, Tensor};

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

const CHECKPOINT_STEM: &str = "training.ckpt";
const CHECKPOINT_EXT: &str = "safetensors";

const EPOCH_KEY: &str = "epoch";
const LEARNING_RATE_KEY: &str = "learning_rate";
const PERF_HISTORY_KEY: &str = "perf_history";

/// Learning-rate schedule state stored alongside the parameters, so a
/// restored run adjusts its rate exactly as an uninterrupted one would.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub learning_rate: f64,
    pub perf_history: Vec<f64>,
}

impl SessionState {
    fn write_metadata(&self, metadata: &mut HashMap<String, String>) {
        metadata.insert(LEARNING_RATE_KEY.to_string(), self.learning_rate.to_string());
        let history: Vec<String> = self.perf_history.iter().map(f64::to_string).collect();
        metadata.insert(PERF_HISTORY_KEY.to_string(), history.join(","));
    }

    fn read_metadata(metadata: &HashMap<String, String>) -> Result<Option<Self>> {
        let (Some(rate), Some(history)) = (
            metadata.get(LEARNING_RATE_KEY),
            metadata.get(PERF_HISTORY_KEY),
        ) else {
            return Ok(None);
        };
        let parse = |key: &str, value: &str| {
            value.parse::<f64>().map_err(|e| {
                ModelError::Checkpoint(format!("bad {} value {:?}: {}", key, value, e))
            })
        };

        let learning_rate = parse(LEARNING_RATE_KEY, rate)?;
        let perf_history = history
            .split(',')
            .filter(|v| !v.is_empty())
            .map(|v| parse(PERF_HISTORY_KEY, v))
            .collect::<Result<Vec<f64>>>()?;
        Ok(Some(Self {
            learning_rate,
            perf_history,
        }))
    }
}

/// `<dir>/training.ckpt-<epoch>.safetensors`
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("{}-{}.{}", CHECKPOINT_STEM, epoch, CHECKPOINT_EXT))
}

fn epoch_of(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix(CHECKPOINT_STEM)?.strip_prefix('-')?;
    rest.strip_suffix(CHECKPOINT_EXT)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// Finds the checkpoint with the highest epoch index in `dir`, if any.
pub fn latest_checkpoint(dir: &Path) -> Result<Option<(usize, PathBuf)>> {
    if !dir.exists() {
        return Ok(None);
    }
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(epoch) = epoch_of(&path) {
            if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
                latest = Some((epoch, path));
            }
        }
    }
    Ok(latest)
}

/// Writes every variable in `vs` as an f32 safetensors file, plus the model
/// hyper-parameters as `config.json` next to it. `session` goes into the
/// file's metadata.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    config: &ModelConfig,
    dir: &Path,
    epoch: usize,
    session: &SessionState,
) -> Result<PathBuf> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }

    let mut encoded: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, var) in vs.variables() {
        let shape: Vec<usize> = var.size().iter().map(|&d| d as usize).collect();
        let flat = var
            .detach()
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .flatten(0, -1);
        let values = Vec::<f32>::try_from(&flat)?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        encoded.push((name, shape, bytes));
    }

    let mut views = Vec::with_capacity(encoded.len());
    for (name, shape, bytes) in &encoded {
        views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    let mut metadata: HashMap<String, String> = [(EPOCH_KEY.to_string(), epoch.to_string())].into();
    session.write_metadata(&mut metadata);
    let path = checkpoint_path(dir, epoch);
    safetensors::tensor::serialize_to_file(views, &Some(metadata), &path)?;

    let config_json = serde_json::to_string_pretty(config)?;
    std::fs::write(dir.join("config.json"), config_json)?;

    info!("saved checkpoint for epoch {} to {:?}", epoch, path);
    Ok(path)
}

/// Copies the tensors stored at `path` into the matching variables of `vs`.
pub fn load_checkpoint<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();

    for (name, view) in tensors.tensors() {
        let Some(var) = variables.get_mut(&name) else {
            warn!("tensor {} found in checkpoint but not in model", name);
            continue;
        };
        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            return Err(ModelError::Checkpoint(format!(
                "tensor {} has shape {:?} in checkpoint but {:?} in model",
                name,
                shape,
                var.size()
            )));
        }
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            other => {
                return Err(ModelError::Checkpoint(format!("unsupported dtype: {:?}", other)))
            }
        };

        let loaded = Tensor::from_data_size(view.data(), &shape, kind)
            .to_kind(var.kind())
            .to_device(device);
        tch::no_grad(|| {
            var.copy_(&loaded);
        });
        debug!("loaded tensor {}", name);
    }

    Ok(())
}

/// Reads the session stored with the checkpoint at `path`. Checkpoints
/// written without one yield `None`.
pub fn load_session<P: AsRef<Path>>(path: P) -> Result<Option<SessionState>> {
    let file = File::open(path.as_ref())?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    match metadata.metadata() {
        Some(metadata) => SessionState::read_metadata(metadata),
        None => Ok(None),
    }
}
