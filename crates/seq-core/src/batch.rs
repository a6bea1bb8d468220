use crate::error::{ModelError, Result};

/// One model step's worth of data for every batch lane.
///
/// Inputs and targets hold one block per unrolled time step. Within a block,
/// values are laid out lane by lane: `inputs[t][lane * num_inputs + k]` and
/// `targets[t][lane]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<Vec<f32>>,
    pub targets: Vec<Vec<i64>>,
    /// Number of valid (non-padded) steps per lane.
    pub seq_lengths: Vec<usize>,
    /// Lanes whose recurrent state must be cleared before this batch.
    pub reset_flags: Vec<bool>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.seq_lengths.len()
    }

    pub fn num_unrollings(&self) -> usize {
        self.inputs.len()
    }

    /// Checks the batch against the geometry a model was built for.
    pub fn check_shape(&self, batch_size: usize, num_unrollings: usize, num_inputs: usize) -> Result<()> {
        if self.seq_lengths.len() != batch_size || self.reset_flags.len() != batch_size {
            return Err(ModelError::Shape(format!(
                "expected {} lanes, got {} sequence lengths and {} reset flags",
                batch_size,
                self.seq_lengths.len(),
                self.reset_flags.len()
            )));
        }
        if self.inputs.len() != num_unrollings || self.targets.len() != num_unrollings {
            return Err(ModelError::Shape(format!(
                "expected {} unrollings, got {} input and {} target blocks",
                num_unrollings,
                self.inputs.len(),
                self.targets.len()
            )));
        }
        for (t, (x, y)) in self.inputs.iter().zip(&self.targets).enumerate() {
            if x.len() != batch_size * num_inputs || y.len() != batch_size {
                return Err(ModelError::Shape(format!(
                    "step {}: {} inputs and {} targets for {} lanes of width {}",
                    t,
                    x.len(),
                    y.len(),
                    batch_size,
                    num_inputs
                )));
            }
        }
        if let Some(&len) = self.seq_lengths.iter().find(|&&len| len > num_unrollings) {
            return Err(ModelError::Shape(format!(
                "sequence length {} exceeds {} unrollings",
                len, num_unrollings
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(lanes: usize, steps: usize, width: usize) -> Batch {
        Batch {
            inputs: vec![vec![0.0; lanes * width]; steps],
            targets: vec![vec![0; lanes]; steps],
            seq_lengths: vec![steps; lanes],
            reset_flags: vec![false; lanes],
        }
    }

    #[test]
    fn accepts_matching_geometry() {
        let b = batch(3, 4, 2);
        assert_eq!(b.batch_size(), 3);
        assert_eq!(b.num_unrollings(), 4);
        assert!(b.check_shape(3, 4, 2).is_ok());
    }

    #[test]
    fn rejects_wrong_width() {
        let b = batch(3, 4, 2);
        assert!(matches!(b.check_shape(3, 4, 5), Err(ModelError::Shape(_))));
    }

    #[test]
    fn rejects_overlong_sequence() {
        let mut b = batch(2, 4, 1);
        b.seq_lengths[1] = 5;
        assert!(matches!(b.check_shape(2, 4, 1), Err(ModelError::Shape(_))));
    }
}
