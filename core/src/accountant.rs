//! Accountant RDP (Rényi Differential Privacy) per il Gaussiano sottocampionato.
//!
//! Serve alla variante "moments accountant" del meccanismo gaussiano: invece
//! di calibrare σ per un singolo rilascio, si compone la perdita di privacy
//! su tutti gli step della sessione e si cerca il noise multiplier minimo che
//! rispetta il target (ε, δ).
//!
//! Per ordini interi α vale l'espansione binomiale esatta (Mironov et al.):
//!
//! ```text
//! A_α = Σ_k C(α,k) (1-q)^(α-k) q^k exp((k² - k) / (2 z²))
//! RDP(α) = ln(A_α) / (α - 1)
//! ```
//!
//! calcolata in log-space per non andare in overflow.

use crate::error::{DpError, Result};

/// Ordini RDP tracciati di default.
fn default_orders() -> Vec<f64> {
    (2..=256).map(f64::from).collect()
}

/// Accountant RDP per il meccanismo gaussiano con sottocampionamento di Poisson.
#[derive(Debug, Clone)]
pub struct RdpAccountant {
    orders: Vec<f64>,
    rdp: Vec<f64>,
    steps: usize,
}

impl RdpAccountant {
    /// Crea un accountant vuoto sugli ordini interi 2..=256.
    #[must_use]
    pub fn new() -> Self {
        let orders = default_orders();
        let rdp = vec![0.0; orders.len()];
        Self {
            orders,
            rdp,
            steps: 0,
        }
    }

    /// Registra `count` step con noise multiplier `z` e sample rate `q`.
    pub fn compose(&mut self, noise_multiplier: f64, sample_rate: f64, count: usize) {
        for (alpha, acc) in self.orders.iter().zip(self.rdp.iter_mut()) {
            *acc += count as f64 * compute_rdp_gaussian(noise_multiplier, sample_rate, *alpha);
        }
        self.steps = self.steps.saturating_add(count);
    }

    /// Registra un singolo step.
    pub fn step(&mut self, noise_multiplier: f64, sample_rate: f64) {
        self.compose(noise_multiplier, sample_rate, 1);
    }

    /// ε speso finora per il `delta` indicato.
    #[must_use]
    pub fn epsilon(&self, delta: f64) -> f64 {
        rdp_to_epsilon(&self.orders, &self.rdp, delta)
    }

    /// Numero di step registrati.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Azzera l'accountant.
    pub fn reset(&mut self) {
        self.rdp.iter_mut().for_each(|r| *r = 0.0);
        self.steps = 0;
    }
}

impl Default for RdpAccountant {
    fn default() -> Self {
        Self::new()
    }
}

/// RDP di un singolo step del Gaussiano sottocampionato all'ordine intero `alpha`.
#[must_use]
pub fn compute_rdp_gaussian(noise_multiplier: f64, sample_rate: f64, alpha: f64) -> f64 {
    if noise_multiplier <= 0.0 {
        return f64::INFINITY;
    }
    if sample_rate <= 0.0 {
        return 0.0;
    }
    let sigma2 = noise_multiplier * noise_multiplier;
    if sample_rate >= 1.0 {
        return alpha / (2.0 * sigma2);
    }

    let q = sample_rate;
    let order = alpha.round() as u32;
    let log_q = q.ln();
    let log_1mq = (1.0 - q).ln();

    let mut log_a = f64::NEG_INFINITY;
    let mut log_binom = 0.0_f64;
    for k in 0..=order {
        if k > 0 {
            log_binom += f64::from(order - k + 1).ln() - f64::from(k).ln();
        }
        let kf = f64::from(k);
        let term = log_binom
            + f64::from(order - k) * log_1mq
            + kf * log_q
            + (kf * kf - kf) / (2.0 * sigma2);
        log_a = log_add(log_a, term);
    }

    log_a / (alpha - 1.0)
}

/// Converte una curva RDP in ε per il `delta` dato (minimo sugli ordini).
#[must_use]
pub fn rdp_to_epsilon(orders: &[f64], rdp: &[f64], delta: f64) -> f64 {
    if delta <= 0.0 || orders.is_empty() {
        return f64::INFINITY;
    }
    let log_delta = delta.ln();

    orders
        .iter()
        .zip(rdp)
        .filter(|(alpha, _)| **alpha > 1.0)
        .map(|(&alpha, &r)| {
            r - (log_delta + alpha.ln()) / (alpha - 1.0) + ((alpha - 1.0) / alpha).ln()
        })
        .filter(|eps| eps.is_finite())
        .fold(f64::INFINITY, f64::min)
        .max(0.0)
}

/// Cerca il noise multiplier minimo che garantisce `(epsilon, delta)` dopo
/// `steps` step con sample rate `sample_rate`.
///
/// # Errori
///
/// [`DpError::Configuration`] se i parametri sono fuori dominio o il target
/// non è raggiungibile con un multiplier ragionevole.
pub fn calibrate_noise_multiplier(
    epsilon: f64,
    delta: f64,
    sample_rate: f64,
    steps: usize,
) -> Result<f64> {
    if epsilon <= 0.0 || !epsilon.is_finite() {
        return Err(DpError::config(format!(
            "epsilon must be > 0 for calibration, got {epsilon}"
        )));
    }
    if delta <= 0.0 || delta >= 1.0 {
        return Err(DpError::config(format!(
            "delta must be in (0, 1) for calibration, got {delta}"
        )));
    }
    if sample_rate <= 0.0 || sample_rate > 1.0 {
        return Err(DpError::config(format!(
            "sample rate must be in (0, 1], got {sample_rate}"
        )));
    }
    if steps == 0 {
        return Err(DpError::config("calibration needs at least one step"));
    }

    let eps_for = |z: f64| {
        let mut acc = RdpAccountant::new();
        acc.compose(z, sample_rate, steps);
        acc.epsilon(delta)
    };

    const MAX_MULTIPLIER: f64 = 1.0e4;
    let mut high = 1.0_f64;
    while eps_for(high) > epsilon {
        high *= 2.0;
        if high > MAX_MULTIPLIER {
            return Err(DpError::config(format!(
                "cannot reach epsilon {epsilon} with delta {delta} in {steps} steps"
            )));
        }
    }
    let mut low = 0.0_f64;

    while high - low > 1.0e-3 * high {
        let mid = 0.5 * (low + high);
        if eps_for(mid) > epsilon {
            low = mid;
        } else {
            high = mid;
        }
    }

    Ok(high)
}

fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}
