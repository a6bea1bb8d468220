use tch::nn::{self, RNN};
use tch::{Kind, Tensor};

use crate::config::{CellKind, ModelConfig};
use crate::error::{ModelError, Result};

enum Cell {
    Lstm(nn::LSTM),
    Gru(nn::GRU),
}

/// Hidden state carried from one model step to the next.
/// Every tensor is `[num_layers, batch, num_hidden]`.
#[derive(Debug)]
pub enum RecurrentState {
    Lstm { h: Tensor, c: Tensor },
    Gru { h: Tensor },
}

impl RecurrentState {
    /// Scales every lane by `keep` (`[1, batch, 1]`, 1.0 keeps and 0.0 clears).
    pub fn mask_lanes(&self, keep: &Tensor) -> Self {
        match self {
            RecurrentState::Lstm { h, c } => RecurrentState::Lstm {
                h: h * keep,
                c: c * keep,
            },
            RecurrentState::Gru { h } => RecurrentState::Gru { h: h * keep },
        }
    }

    /// Takes `self` on lanes where `active` is 1.0 and `previous` where `idle` is 1.0.
    fn select_active(self, previous: &RecurrentState, active: &Tensor, idle: &Tensor) -> Result<Self> {
        let blend = |new: &Tensor, old: &Tensor| new * active + old * idle;
        match (&self, previous) {
            (RecurrentState::Lstm { h, c }, RecurrentState::Lstm { h: h0, c: c0 }) => {
                Ok(RecurrentState::Lstm {
                    h: blend(h, h0),
                    c: blend(c, c0),
                })
            }
            (RecurrentState::Gru { h }, RecurrentState::Gru { h: h0 }) => {
                Ok(RecurrentState::Gru { h: blend(h, h0) })
            }
            _ => Err(ModelError::Shape("recurrent state does not match cell kind".to_string())),
        }
    }

    /// Output of the top layer, `[batch, num_hidden]`.
    fn top(&self) -> Tensor {
        let h = match self {
            RecurrentState::Lstm { h, .. } => h,
            RecurrentState::Gru { h } => h,
        };
        h.get(h.size()[0] - 1)
    }

    /// Cuts the autograd history so the next step does not backpropagate into this one.
    pub fn detach(&self) -> Self {
        match self {
            RecurrentState::Lstm { h, c } => RecurrentState::Lstm {
                h: h.detach(),
                c: c.detach(),
            },
            RecurrentState::Gru { h } => RecurrentState::Gru { h: h.detach() },
        }
    }
}

/// Stacked LSTM/GRU followed by a linear classifier applied at every time step.
pub struct RecurrentNet {
    cell: Cell,
    head: nn::Linear,
    dropout: f64,
    pub config: ModelConfig,
}

impl RecurrentNet {
    pub fn new(vs: &nn::Path, config: &ModelConfig) -> Self {
        let rnn_config = nn::RNNConfig {
            num_layers: config.num_layers,
            batch_first: true,
            ..Default::default()
        };
        let cell = match config.cell {
            CellKind::Lstm => Cell::Lstm(nn::lstm(
                vs / "rnn",
                config.num_inputs,
                config.num_hidden,
                rnn_config,
            )),
            CellKind::Gru => Cell::Gru(nn::gru(
                vs / "rnn",
                config.num_inputs,
                config.num_hidden,
                rnn_config,
            )),
        };
        let head = nn::linear(vs / "head", config.num_hidden, config.num_outputs, Default::default());

        Self {
            cell,
            head,
            dropout: config.dropout(),
            config: config.clone(),
        }
    }

    pub fn zero_state(&self, batch_size: i64) -> RecurrentState {
        match &self.cell {
            Cell::Lstm(lstm) => {
                let state = lstm.zero_state(batch_size);
                RecurrentState::Lstm {
                    h: state.h(),
                    c: state.c(),
                }
            }
            Cell::Gru(gru) => RecurrentState::Gru {
                h: gru.zero_state(batch_size).value(),
            },
        }
    }

    fn cell_step(&self, x: &Tensor, state: &RecurrentState) -> Result<RecurrentState> {
        match (&self.cell, state) {
            (Cell::Lstm(lstm), RecurrentState::Lstm { h, c }) => {
                let next = lstm.step(x, &nn::LSTMState((h.shallow_clone(), c.shallow_clone())));
                Ok(RecurrentState::Lstm {
                    h: next.h(),
                    c: next.c(),
                })
            }
            (Cell::Gru(gru), RecurrentState::Gru { h }) => {
                let next = gru.step(x, &nn::GRUState(h.shallow_clone()));
                Ok(RecurrentState::Gru { h: next.value() })
            }
            _ => Err(ModelError::Shape("recurrent state does not match cell kind".to_string())),
        }
    }

    /// Runs the unrolled sequence.
    ///
    /// x: `[batch, unrollings, num_inputs]`, seq_lengths: `[batch]` (Int64).
    /// Returns logits `[batch, unrollings, num_outputs]` and the state after the
    /// last valid step of each lane. Padded steps leave the state untouched.
    pub fn forward(
        &self,
        x: &Tensor,
        seq_lengths: &Tensor,
        state: RecurrentState,
        train: bool,
    ) -> Result<(Tensor, RecurrentState)> {
        let (_, steps, _) = x.size3()?;
        let mut outputs = Vec::with_capacity(steps as usize);
        let mut state = state;

        for t in 0..steps {
            let next = self.cell_step(&x.select(1, t), &state)?;
            let active = seq_lengths.gt(t).to_kind(Kind::Float).view([1, -1, 1]);
            let idle = seq_lengths.le(t).to_kind(Kind::Float).view([1, -1, 1]);
            state = next.select_active(&state, &active, &idle)?;
            outputs.push(state.top());
        }

        let hidden = Tensor::stack(&outputs, 1).dropout(self.dropout, train);
        Ok((hidden.apply(&self.head), state))
    }
}
