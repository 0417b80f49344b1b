//! Campionamento di rumore calibrato per i meccanismi Laplace e Gaussiano.
//!
//! Tutta la casualità passa per un generatore iniettato (`rand::Rng`), così i
//! test possono fissare il seed e il chiamante decide la sorgente (es. un
//! CSPRNG in produzione).
//!
//! - Laplace: scala `b = sensibilità / ε`, varianza `2 b²`;
//! - Gaussiano semplice: `σ = sensibilità × √(2 ln(1.25/δ)) / ε`;
//! - Gaussiano moments-accountant: `σ = z × sensibilità`, con `z` calibrato
//!   su tutta la sessione (vedi [`crate::accountant`]).

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{DpError, Result};
use crate::Tensor;

/// Sampler di rumore già calibrato su una specifica scala.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseSampler {
    /// Laplace(0, b) con `scale = b`.
    Laplace {
        /// Parametro di scala `b`.
        scale: f64,
    },
    /// N(0, σ²) con `sigma = σ`.
    Gaussian {
        /// Deviazione standard σ.
        sigma: f64,
    },
}

impl NoiseSampler {
    /// Meccanismo di Laplace per un singolo rilascio.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidParameter`] se `epsilon <= 0` o la sensibilità non è valida.
    pub fn laplace(epsilon: f64, sensitivity: f64) -> Result<Self> {
        check_epsilon(epsilon)?;
        check_sensitivity(sensitivity)?;
        Ok(Self::Laplace {
            scale: sensitivity / epsilon,
        })
    }

    /// Meccanismo gaussiano analitico per un singolo rilascio.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidParameter`] se `epsilon <= 0` o `delta ∉ (0, 1)`.
    pub fn gaussian_simple(epsilon: f64, delta: f64, sensitivity: f64) -> Result<Self> {
        check_epsilon(epsilon)?;
        if !(delta > 0.0 && delta < 1.0) {
            return Err(DpError::parameter(format!(
                "delta must be in (0, 1), got {delta}"
            )));
        }
        check_sensitivity(sensitivity)?;
        let sigma = sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon;
        Ok(Self::Gaussian { sigma })
    }

    /// Gaussiano con noise multiplier già calibrato dal moments accountant.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidParameter`] se il multiplier non è positivo e finito.
    pub fn gaussian_moment(noise_multiplier: f64, sensitivity: f64) -> Result<Self> {
        if !(noise_multiplier > 0.0 && noise_multiplier.is_finite()) {
            return Err(DpError::parameter(format!(
                "noise multiplier must be > 0, got {noise_multiplier}"
            )));
        }
        check_sensitivity(sensitivity)?;
        Ok(Self::Gaussian {
            sigma: noise_multiplier * sensitivity,
        })
    }

    /// Scala del rumore (`b` per Laplace, `σ` per il Gaussiano).
    #[must_use]
    pub fn scale(&self) -> f64 {
        match *self {
            Self::Laplace { scale } => scale,
            Self::Gaussian { sigma } => sigma,
        }
    }

    /// Varianza teorica di un singolo campione.
    #[must_use]
    pub fn variance(&self) -> f64 {
        match *self {
            Self::Laplace { scale } => 2.0 * scale * scale,
            Self::Gaussian { sigma } => sigma * sigma,
        }
    }

    /// Campiona un tensore i.i.d. con la shape indicata.
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> Tensor {
        match *self {
            Self::Laplace { scale } => {
                ArrayD::from_shape_simple_fn(IxDyn(shape), || sample_laplace(scale, rng) as f32)
            }
            Self::Gaussian { sigma } => ArrayD::from_shape_simple_fn(IxDyn(shape), || {
                let z: f64 = rng.sample(StandardNormal);
                (sigma * z) as f32
            }),
        }
    }
}

/// Rumore di Laplace con shape arbitraria.
///
/// # Errori
///
/// [`DpError::InvalidParameter`] se `epsilon <= 0`.
pub fn laplace<R: Rng + ?Sized>(
    epsilon: f64,
    sensitivity: f64,
    shape: &[usize],
    rng: &mut R,
) -> Result<Tensor> {
    Ok(NoiseSampler::laplace(epsilon, sensitivity)?.sample(shape, rng))
}

/// Rumore gaussiano (composizione semplice) con shape arbitraria.
///
/// # Errori
///
/// [`DpError::InvalidParameter`] se `epsilon <= 0` o `delta ∉ (0, 1)`.
pub fn gaussian_simple<R: Rng + ?Sized>(
    epsilon: f64,
    delta: f64,
    sensitivity: f64,
    shape: &[usize],
    rng: &mut R,
) -> Result<Tensor> {
    Ok(NoiseSampler::gaussian_simple(epsilon, delta, sensitivity)?.sample(shape, rng))
}

/// Inverse CDF: `-b · sign(u) · ln(1 - 2|u|)` con `u ~ U[-0.5, 0.5)`.
fn sample_laplace<R: Rng + ?Sized>(scale: f64, rng: &mut R) -> f64 {
    let u: f64 = rng.random::<f64>() - 0.5;
    let tail = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
    -scale * u.signum() * tail.ln()
}

fn check_epsilon(epsilon: f64) -> Result<()> {
    if epsilon > 0.0 && epsilon.is_finite() {
        Ok(())
    } else {
        Err(DpError::parameter(format!(
            "epsilon must be > 0, got {epsilon}"
        )))
    }
}

fn check_sensitivity(sensitivity: f64) -> Result<()> {
    if sensitivity >= 0.0 && sensitivity.is_finite() {
        Ok(())
    } else {
        Err(DpError::parameter(format!(
            "sensitivity must be finite and >= 0, got {sensitivity}"
        )))
    }
}
