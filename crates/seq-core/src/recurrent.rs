use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::info;
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};

use crate::batch::Batch;
use crate::checkpoint::{self, SessionState};
use crate::config::{ModelConfig, OptimizerKind};
use crate::error::{ModelError, Result};
use crate::model::{EvalOp, SequenceModel, StepOutput, TrainableModel};
use crate::rnn::{RecurrentNet, RecurrentState};

struct SharedNet {
    vs: nn::VarStore,
    net: RecurrentNet,
}

/// Handle on a [`RecurrentNet`] whose parameters may be shared with other handles.
///
/// The training handle owns the optimizer; the evaluation handle only runs
/// forward passes, and rejects [`EvalOp::Train`].
pub struct RecurrentModel {
    shared: Rc<SharedNet>,
    optimizer: Option<nn::Optimizer>,
    device: Device,
}

/// Builds a training model and an evaluation model over the same parameters.
///
/// When `resume_from` is given, the parameters are restored from that
/// checkpoint before the optimizer is created.
pub fn build_model_pair(
    config: &ModelConfig,
    device: Device,
    resume_from: Option<&Path>,
) -> Result<(RecurrentModel, RecurrentModel)> {
    let vs = nn::VarStore::new(device);
    let net = RecurrentNet::new(&vs.root(), config);

    if let Some(path) = resume_from {
        info!("restoring parameters from {:?}", path);
        checkpoint::load_checkpoint(&vs, path)?;
    }

    let learning_rate = config.initial_learning_rate;
    let optimizer = match config.optimizer {
        OptimizerKind::Sgd => nn::Sgd::default().build(&vs, learning_rate)?,
        OptimizerKind::Adam => nn::Adam::default().build(&vs, learning_rate)?,
        OptimizerKind::AdamW => nn::AdamW::default().build(&vs, learning_rate)?,
    };

    let shared = Rc::new(SharedNet { vs, net });
    let train = RecurrentModel {
        shared: Rc::clone(&shared),
        optimizer: Some(optimizer),
        device,
    };
    let valid = RecurrentModel {
        shared,
        optimizer: None,
        device,
    };
    Ok((train, valid))
}

struct BatchTensors {
    x: Tensor,
    y: Tensor,
    lengths: Tensor,
    keep: Tensor,
}

impl BatchTensors {
    fn new(batch: &Batch, num_inputs: i64, device: Device) -> Self {
        let steps = batch.num_unrollings() as i64;
        let lanes = batch.batch_size() as i64;

        let x = Tensor::from_slice(&batch.inputs.concat())
            .view([steps, lanes, num_inputs])
            .transpose(0, 1)
            .contiguous()
            .to_device(device);
        let y = Tensor::from_slice(&batch.targets.concat())
            .view([steps, lanes])
            .transpose(0, 1)
            .contiguous()
            .to_device(device);

        let lengths: Vec<i64> = batch.seq_lengths.iter().map(|&len| len as i64).collect();
        let keep: Vec<f32> = batch
            .reset_flags
            .iter()
            .map(|&reset| if reset { 0.0 } else { 1.0 })
            .collect();

        Self {
            x,
            y,
            lengths: Tensor::from_slice(&lengths).to_device(device),
            keep: Tensor::from_slice(&keep).view([1, lanes, 1]).to_device(device),
        }
    }
}

/// Mean cross-entropy and misclassification rate over the unpadded elements.
fn masked_loss(logits: &Tensor, targets: &Tensor, seq_lengths: &Tensor) -> Result<(Tensor, Tensor)> {
    let (lanes, steps, _) = logits.size3()?;
    let positions = Tensor::arange(steps, (Kind::Int64, logits.device())).view([1, steps]);
    let mask = positions
        .lt_tensor(&seq_lengths.view([lanes, 1]))
        .to_kind(Kind::Float);
    let valid = mask.sum(Kind::Float).clamp_min(1.0);

    let nll = -logits
        .log_softmax(-1, Kind::Float)
        .gather(2, &targets.unsqueeze(-1), false)
        .squeeze_dim(-1);
    let cost = (nll * &mask).sum(Kind::Float) / &valid;

    let wrong = logits.argmax(-1, false).ne_tensor(targets).to_kind(Kind::Float);
    let error = (wrong * &mask).sum(Kind::Float) / &valid;

    Ok((cost, error))
}

impl RecurrentModel {
    pub fn config(&self) -> &ModelConfig {
        &self.shared.net.config
    }

    fn check_batch(&self, batch: &Batch) -> Result<()> {
        let config = self.config();
        batch.check_shape(
            config.batch_size,
            config.num_unrollings,
            config.num_inputs as usize,
        )?;
        if let Some(&target) = batch
            .targets
            .iter()
            .flatten()
            .find(|&&y| y < 0 || y >= config.num_outputs)
        {
            return Err(ModelError::Shape(format!(
                "target class {} outside 0..{}",
                target, config.num_outputs
            )));
        }
        Ok(())
    }

    fn run(
        &self,
        tensors: &BatchTensors,
        state: RecurrentState,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, RecurrentState)> {
        let (logits, next) = self
            .shared
            .net
            .forward(&tensors.x, &tensors.lengths, state, train)?;
        let (cost, error) = masked_loss(&logits, &tensors.y, &tensors.lengths)?;
        let probs = logits
            .detach()
            .softmax(-1, Kind::Float)
            .to_device(Device::Cpu)
            .flatten(0, -1);
        Ok((cost, error, probs, next))
    }
}

impl SequenceModel for RecurrentModel {
    type State = RecurrentState;

    fn batch_size(&self) -> usize {
        self.config().batch_size
    }

    fn num_unrollings(&self) -> usize {
        self.config().num_unrollings
    }

    fn step(
        &mut self,
        op: EvalOp,
        batch: &Batch,
        state: Option<RecurrentState>,
    ) -> Result<StepOutput<RecurrentState>> {
        if op == EvalOp::Train && self.optimizer.is_none() {
            return Err(ModelError::ReadOnly);
        }
        self.check_batch(batch)?;

        let tensors = BatchTensors::new(batch, self.config().num_inputs, self.device);
        let state = match state {
            Some(state) => state.mask_lanes(&tensors.keep),
            None => self.shared.net.zero_state(batch.batch_size() as i64),
        };

        let (cost, error, probs, next) = match op {
            EvalOp::Train => {
                let (cost, error, probs, next) = self.run(&tensors, state, true)?;
                let max_grad_norm = self.config().max_grad_norm;
                if let Some(optimizer) = self.optimizer.as_mut() {
                    if max_grad_norm > 0.0 {
                        optimizer.backward_step_clip_norm(&cost, max_grad_norm);
                    } else {
                        optimizer.backward_step(&cost);
                    }
                }
                (cost, error, probs, next.detach())
            }
            EvalOp::Evaluate => tch::no_grad(|| self.run(&tensors, state, false))?,
        };

        Ok(StepOutput {
            cost: cost.double_value(&[]),
            error: error.double_value(&[]),
            state: next,
            predictions: Vec::<f32>::try_from(&probs)?,
        })
    }
}

impl TrainableModel for RecurrentModel {
    fn set_learning_rate(&mut self, learning_rate: f64) {
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.set_lr(learning_rate);
        }
    }

    fn save_checkpoint(&self, dir: &Path, epoch: usize, session: &SessionState) -> Result<PathBuf> {
        checkpoint::save_checkpoint(&self.shared.vs, self.config(), dir, epoch, session)
    }
}
