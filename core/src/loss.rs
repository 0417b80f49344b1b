//! Cross-entropy sui logit di classe.

use ndarray::{Array1, Array2, Axis};

use crate::error::{DpError, Result};

/// Output della cross-entropy su un batch.
#[derive(Debug, Clone)]
pub struct CrossEntropyOutput {
    /// Loss di ogni sample.
    pub per_sample: Array1<f32>,
    /// Media delle loss sul batch (riduzione `mean`).
    pub mean: f32,
    /// `∂loss_i / ∂logits_i` per ogni riga, **non** diviso per il batch.
    pub grad_logits: Array2<f32>,
}

impl CrossEntropyOutput {
    /// Gradiente della loss media rispetto ai logit (`grad_logits / B`).
    #[must_use]
    pub fn mean_grad_logits(&self) -> Array2<f32> {
        let batch = self.grad_logits.nrows().max(1) as f32;
        &self.grad_logits / batch
    }
}

/// Cross-entropy con log-softmax stabile.
///
/// # Errori
///
/// [`DpError::InvalidState`] se il numero di label non coincide con le righe
/// dei logit, se il batch è vuoto o se una label è fuori range.
pub fn cross_entropy(logits: &Array2<f32>, labels: &[usize]) -> Result<CrossEntropyOutput> {
    let (rows, classes) = logits.dim();
    if rows == 0 {
        return Err(DpError::state("cross-entropy on an empty batch"));
    }
    if rows != labels.len() {
        return Err(DpError::state(format!(
            "logits have {rows} rows but {} labels were given",
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(DpError::state(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }

    let mut per_sample = Array1::<f32>::zeros(rows);
    let mut grad_logits = Array2::<f32>::zeros((rows, classes));

    for (i, (row, mut grad)) in logits
        .axis_iter(Axis(0))
        .zip(grad_logits.axis_iter_mut(Axis(0)))
        .enumerate()
    {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let sum_exp: f32 = row.iter().map(|&x| (x - max).exp()).sum();
        let log_z = max + sum_exp.ln();

        per_sample[i] = log_z - row[labels[i]];

        grad.assign(&row.mapv(|x| (x - log_z).exp()));
        grad[labels[i]] -= 1.0;
    }

    let mean = per_sample.mean().unwrap_or(0.0);

    Ok(CrossEntropyOutput {
        per_sample,
        mean,
        grad_logits,
    })
}
