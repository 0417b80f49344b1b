//! SGD con momentum e decadimento geometrico del learning rate.

use ndarray::ArrayD;

use crate::error::{DpError, Result};
use crate::ParamMap;

/// SGD con momentum: `v ← μ·v + g`, `p ← p − lr·v`.
///
/// Al primo step la velocità parte da zero, quindi `v = g`.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    lr: f64,
    momentum: f32,
    velocity: ParamMap,
}

impl MomentumSgd {
    /// Crea l'ottimizzatore.
    #[must_use]
    pub fn new(lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum: momentum as f32,
            velocity: ParamMap::new(),
        }
    }

    /// Learning rate corrente.
    #[must_use]
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Imposta il learning rate (usato dallo scheduler).
    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Aggiorna `params` in-place con i gradienti `grads`.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se manca il gradiente di un parametro o le
    /// shape non coincidono. I controlli precedono ogni modifica: in caso di
    /// errore parametri e velocità restano invariati.
    pub fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()> {
        for name in grads.keys() {
            if !params.contains_key(name) {
                return Err(DpError::state(format!(
                    "gradient for unknown parameter {name}"
                )));
            }
        }
        for (name, param) in params.iter() {
            let grad = grads
                .get(name)
                .ok_or_else(|| DpError::state(format!("missing gradient for parameter {name}")))?;
            if grad.shape() != param.shape() {
                return Err(DpError::state(format!(
                    "gradient for {name} has shape {:?}, parameter has {:?}",
                    grad.shape(),
                    param.shape()
                )));
            }
        }

        let lr = self.lr as f32;
        let mu = self.momentum;

        for (name, param) in params.iter_mut() {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let velocity = self
                .velocity
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            velocity.zip_mut_with(grad, |v, &g| *v = mu * *v + g);
            param.zip_mut_with(velocity, |p, &v| *p -= lr * v);
        }
        Ok(())
    }
}

/// Decadimento geometrico: ogni `step` moltiplica il learning rate per `gamma`.
#[derive(Debug, Clone, Copy)]
pub struct StepLr {
    gamma: f64,
    steps: usize,
}

impl StepLr {
    /// Crea lo scheduler con fattore `gamma`.
    #[must_use]
    pub fn new(gamma: f64) -> Self {
        Self { gamma, steps: 0 }
    }

    /// Applica un passo di decadimento all'ottimizzatore.
    pub fn step(&mut self, optimizer: &mut MomentumSgd) {
        optimizer.set_lr(optimizer.lr() * self.gamma);
        self.steps += 1;
    }

    /// Numero di passi eseguiti.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }
}
