//! Compute steps a worker runs between transmissions.
//!
//! The scheduler never sees what a job computes, only how long it took, so a
//! workload is anything that can run one step and take some wall-clock time.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ArbiterError, Result};

/// One round's compute phase.
#[async_trait]
pub trait Workload: Send {
    /// Run a single compute step to completion.
    async fn compute(&mut self) -> Result<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Sleeps for a fixed duration. Useful for simulations where compute cost
/// must be controlled exactly.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Workload for FixedDelay {
    async fn compute(&mut self) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fixed-delay"
    }
}

/// Default mini-batch size for [`DenseLayer`].
pub const DEFAULT_BATCH: usize = 64;

const LEARNING_RATE: f32 = 0.01;

/// Weights and inputs of a single fully-connected layer.
#[derive(Debug, Default)]
struct LayerState {
    size: usize,
    batch: usize,
    weights: Vec<f32>,
    inputs: Vec<f32>,
}

impl LayerState {
    fn new(size: usize, batch: usize) -> Self {
        let mut seed = 0x2545_f491_u32;
        let mut next = move || {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        };

        let weights = (0..size * size).map(|_| next() * 0.1).collect();
        let inputs = (0..batch * size).map(|_| next()).collect();

        Self {
            size,
            batch,
            weights,
            inputs,
        }
    }

    /// Forward pass, sum loss, and one SGD step. Returns the loss.
    fn step(&mut self) -> f32 {
        let n = self.size;
        let mut loss = 0.0f32;

        // out[b][i] = sum_j w[i][j] * x[b][j]
        for b in 0..self.batch {
            let x = &self.inputs[b * n..(b + 1) * n];
            for i in 0..n {
                let row = &self.weights[i * n..(i + 1) * n];
                loss += row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>();
            }
        }

        // d(loss)/d(w[i][j]) = sum_b x[b][j], identical for every row.
        let mut column_sums = vec![0.0f32; n];
        for b in 0..self.batch {
            for (sum, x) in column_sums.iter_mut().zip(&self.inputs[b * n..(b + 1) * n]) {
                *sum += x;
            }
        }
        for row in self.weights.chunks_mut(n) {
            for (w, g) in row.iter_mut().zip(&column_sums) {
                *w -= LEARNING_RATE * g;
            }
        }

        loss
    }
}

/// A dense `size x size` layer trained on a fixed random batch. Compute cost
/// grows with `size^2`, so larger models spend longer in the compute phase.
pub struct DenseLayer {
    state: LayerState,
    last_loss: f32,
}

impl DenseLayer {
    pub fn new(size: usize) -> Self {
        Self::with_batch(size, DEFAULT_BATCH)
    }

    pub fn with_batch(size: usize, batch: usize) -> Self {
        Self {
            state: LayerState::new(size, batch),
            last_loss: 0.0,
        }
    }

    pub fn size(&self) -> usize {
        self.state.size
    }

    pub fn last_loss(&self) -> f32 {
        self.last_loss
    }
}

#[async_trait]
impl Workload for DenseLayer {
    async fn compute(&mut self) -> Result<()> {
        let mut state = std::mem::take(&mut self.state);

        let (state, loss) = tokio::task::spawn_blocking(move || {
            let loss = state.step();
            (state, loss)
        })
        .await
        .map_err(|e| ArbiterError::workload(format!("compute step panicked: {e}")))?;

        self.state = state;
        self.last_loss = loss;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dense-layer"
    }
}
