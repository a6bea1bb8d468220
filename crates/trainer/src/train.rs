use std::fmt;
use std::path::PathBuf;

use log::info;
use seq_core::{EvalOp, SequenceModel, SessionState, TrainableModel};

use crate::batches::BatchSource;
use crate::config::TrainerConfig;
use crate::epoch::{run_epoch, EpochOptions, EpochResult};
use crate::error::Result;
use crate::lr::{adjust_learning_rate, LrPolicy};

/// State that lives for a whole training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSession {
    pub learning_rate: f64,
    /// Training cost of every finished epoch, oldest first. Only ever appended to.
    pub perf_history: Vec<f64>,
}

impl TrainingSession {
    pub fn new(initial_learning_rate: f64) -> Self {
        Self {
            learning_rate: initial_learning_rate,
            perf_history: Vec::new(),
        }
    }

    /// Applies the policy to the history recorded so far.
    pub fn adjust_learning_rate(&mut self, policy: &LrPolicy) -> f64 {
        self.learning_rate = adjust_learning_rate(self.learning_rate, &self.perf_history, policy);
        self.learning_rate
    }

    pub fn record(&mut self, train_xentropy: f64) {
        self.perf_history.push(train_xentropy);
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            learning_rate: self.learning_rate,
            perf_history: self.perf_history.clone(),
        }
    }
}

impl From<SessionState> for TrainingSession {
    fn from(state: SessionState) -> Self {
        Self {
            learning_rate: state.learning_rate,
            perf_history: state.perf_history,
        }
    }
}

/// Metrics of one finished epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    /// Zero-based epoch index, as used in checkpoint names.
    pub epoch: usize,
    pub train_xentropy: f64,
    pub valid_xentropy: f64,
    pub train_error: f64,
    pub valid_error: f64,
    pub learning_rate: f64,
    /// Set once the epoch's checkpoint has been written.
    pub checkpoint: Option<PathBuf>,
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Epoch: {} XEntrop: {:.6} {:.6} Error: {:.6} {:.6} Learning rate: {:.3}",
            self.epoch + 1,
            self.train_xentropy,
            self.valid_xentropy,
            self.train_error,
            self.valid_error,
            self.learning_rate
        )
    }
}

/// Alternates training and validation epochs, adapting the learning rate and
/// checkpointing the training model after each one.
pub struct Trainer<T, V> {
    config: TrainerConfig,
    policy: LrPolicy,
    session: TrainingSession,
    train_model: T,
    valid_model: V,
    first_epoch: usize,
}

impl<T, V> Trainer<T, V>
where
    T: TrainableModel,
    V: SequenceModel,
{
    pub fn new(config: TrainerConfig, train_model: T, valid_model: V) -> Result<Self> {
        config.validate()?;
        let policy = config.lr_policy()?;
        let session = TrainingSession::new(config.initial_learning_rate);

        Ok(Self {
            config,
            policy,
            session,
            train_model,
            valid_model,
            first_epoch: 0,
        })
    }

    /// Numbers epochs from `epoch` instead of zero, e.g. after restoring a checkpoint.
    pub fn starting_at(mut self, epoch: usize) -> Self {
        self.first_epoch = epoch;
        self
    }

    /// Continues the learning-rate schedule of an earlier run.
    pub fn with_session(mut self, session: TrainingSession) -> Self {
        self.session = session;
        self
    }

    pub fn session(&self) -> &TrainingSession {
        &self.session
    }

    pub fn into_models(self) -> (T, V) {
        (self.train_model, self.valid_model)
    }

    /// Runs epochs `first_epoch..max_epoch`. Any error ends the run; the
    /// checkpoint of a failed epoch is never written.
    pub fn train<TB, VB>(
        &mut self,
        train_batches: &mut TB,
        valid_batches: &mut VB,
    ) -> Result<Vec<EpochReport>>
    where
        TB: BatchSource + ?Sized,
        VB: BatchSource + ?Sized,
    {
        info!("starting training with configuration: {:?}", self.config);

        let mut reports = Vec::new();
        for epoch in self.first_epoch..self.config.max_epoch {
            let report = self.run_one_epoch(epoch, train_batches, valid_batches)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn run_one_epoch<TB, VB>(
        &mut self,
        epoch: usize,
        train_batches: &mut TB,
        valid_batches: &mut VB,
    ) -> Result<EpochReport>
    where
        TB: BatchSource + ?Sized,
        VB: BatchSource + ?Sized,
    {
        let learning_rate = self.session.adjust_learning_rate(&self.policy);
        self.train_model.set_learning_rate(learning_rate);

        let train_options = self.train_options();
        let valid_options = self.valid_options();
        let train = run_epoch(&mut self.train_model, train_batches, EvalOp::Train, &train_options)?;
        let valid = run_epoch(&mut self.valid_model, valid_batches, EvalOp::Evaluate, &valid_options)?;

        let mut report = EpochReport {
            epoch,
            train_xentropy: train.perplexity,
            valid_xentropy: valid.perplexity,
            train_error: train.error,
            valid_error: valid.error,
            learning_rate,
            checkpoint: None,
        };
        println!("{}", report);
        info!("{}", report);

        self.session.record(train.perplexity);
        let checkpoint = self.train_model.save_checkpoint(
            &self.config.model_dir,
            epoch,
            &self.session.state(),
        )?;
        report.checkpoint = Some(checkpoint);

        if self.config.check {
            self.check(epoch, train_batches, &valid)?;
        }

        Ok(report)
    }

    /// Evaluates the training data with the training model. When train and
    /// valid point at the same file the numbers should match the validation
    /// pass (exactly only with `keep_prob == 1`).
    fn check<TB>(&mut self, epoch: usize, train_batches: &mut TB, valid: &EpochResult) -> Result<()>
    where
        TB: BatchSource + ?Sized,
    {
        let options = self.valid_options();
        let check = run_epoch(&mut self.train_model, train_batches, EvalOp::Evaluate, &options)?;
        println!(
            "Check: {} XEntrop: {:.2} =? {:.2} Error: {:.6} =? {:.6}",
            epoch + 1,
            check.perplexity,
            valid.perplexity,
            check.error,
            valid.error
        );
        Ok(())
    }

    fn train_options(&self) -> EpochOptions {
        EpochOptions {
            passes: self.config.passes,
            eval_all: true,
            min_history: 0,
            verbose: self.config.verbose,
        }
    }

    fn valid_options(&self) -> EpochOptions {
        EpochOptions {
            passes: 1,
            eval_all: !self.config.skip_predata,
            min_history: self.config.min_history,
            verbose: self.config.verbose,
        }
    }
}
