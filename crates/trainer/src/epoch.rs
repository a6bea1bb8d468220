use std::io::{self, Write};
use std::time::{Duration, Instant};

use log::debug;
use seq_core::{EvalOp, SequenceModel};

use crate::batches::BatchSource;
use crate::error::{Result, TrainError};

/// Number of markers a finished progress line always shows.
const PROGRESS_WIDTH: usize = 100;

#[derive(Debug, Clone)]
pub struct EpochOptions {
    /// Full passes over the batch source.
    pub passes: usize,
    /// When false, steps the source reports as predata are left out of the averages.
    pub eval_all: bool,
    pub min_history: usize,
    /// Print a progress line and a summary to the output sink.
    pub verbose: bool,
}

impl Default for EpochOptions {
    fn default() -> Self {
        Self {
            passes: 1,
            eval_all: true,
            min_history: 0,
            verbose: false,
        }
    }
}

/// Running sums over the counted steps of one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub cost_sum: f64,
    pub error_sum: f64,
    pub count: usize,
}

impl EpochStats {
    fn record(&mut self, cost: f64, error: f64) {
        self.cost_sum += cost;
        self.error_sum += error;
        self.count += 1;
    }

    pub fn perplexity(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.cost_sum / self.count as f64).exp())
    }

    pub fn mean_error(&self) -> Option<f64> {
        (self.count > 0).then(|| self.error_sum / self.count as f64)
    }
}

#[derive(Debug, Clone)]
pub struct EpochResult {
    /// `exp` of the mean per-step cost.
    pub perplexity: f64,
    pub error: f64,
    pub stats: EpochStats,
    /// `passes * num_steps`, counted or not.
    pub total_steps: usize,
    pub elapsed: Duration,
}

/// Dot progress line that never exceeds [`PROGRESS_WIDTH`] markers.
#[derive(Debug)]
pub struct Progress {
    interval: usize,
    step: usize,
    markers: usize,
}

impl Progress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            interval: total_steps.div_ceil(PROGRESS_WIDTH).max(1),
            step: 0,
            markers: 0,
        }
    }

    pub fn tick<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if self.step % self.interval == 0 {
            self.markers += 1;
            write!(out, ".")?;
            out.flush()?;
        }
        self.step += 1;
        Ok(())
    }

    /// Pads the line to the full width.
    pub fn finish<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(out, "{}", ".".repeat(PROGRESS_WIDTH.saturating_sub(self.markers)))
    }

    pub fn markers(&self) -> usize {
        self.markers
    }
}

/// Runs `options.passes` passes of `batches` through `model`, printing
/// progress to stdout when verbose.
pub fn run_epoch<M, B>(
    model: &mut M,
    batches: &mut B,
    op: EvalOp,
    options: &EpochOptions,
) -> Result<EpochResult>
where
    M: SequenceModel + ?Sized,
    B: BatchSource + ?Sized,
{
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run_epoch_to(model, batches, op, options, &mut out)
}

/// Same as [`run_epoch`], writing progress to `out`.
///
/// The cursor of `batches` is rewound first and the recurrent state starts
/// from zero, so repeated calls over unchanged parameters give equal results.
pub fn run_epoch_to<M, B, W>(
    model: &mut M,
    batches: &mut B,
    op: EvalOp,
    options: &EpochOptions,
    out: &mut W,
) -> Result<EpochResult>
where
    M: SequenceModel + ?Sized,
    B: BatchSource + ?Sized,
    W: Write,
{
    let num_steps = batches.num_steps();
    if num_steps == 0 {
        return Err(TrainError::Configuration(
            "batch_size*num_unrollings is larger than the training set size".to_string(),
        ));
    }

    let start = Instant::now();
    let total_steps = options.passes * num_steps;
    let mut stats = EpochStats::default();
    let mut progress = Progress::new(total_steps);
    let mut state = None;

    batches.rewind_cursor();

    for _ in 0..options.passes {
        for _ in 0..num_steps {
            let predata = !options.eval_all && batches.is_predata(options.min_history);
            let batch = batches.next_batch();

            let output = model.step(op, &batch, state.take())?;
            state = Some(output.state);

            if !predata {
                stats.record(output.cost, output.error);
            }
            if options.verbose {
                progress.tick(out)?;
            }
        }
    }

    let elapsed = start.elapsed();
    if options.verbose {
        progress.finish(out)?;
        let elements = model.batch_size() * model.num_unrollings();
        writeln!(
            out,
            " evals: {} (of {}), speed: {:.0} seconds",
            stats.count * elements,
            total_steps * elements,
            elapsed.as_secs_f64()
        )?;
    }
    out.flush()?;

    debug!(
        "{:?} epoch: {} of {} steps counted in {:.2?}",
        op, stats.count, total_steps, elapsed
    );

    match (stats.perplexity(), stats.mean_error()) {
        (Some(perplexity), Some(error)) => Ok(EpochResult {
            perplexity,
            error,
            stats,
            total_steps,
            elapsed,
        }),
        _ => Err(TrainError::Division { total_steps }),
    }
}
