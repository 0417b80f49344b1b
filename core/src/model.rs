//! Seam verso il modello esterno e un classificatore lineare di riferimento.
//!
//! Il trainer non conosce l'architettura: gli basta un [`TrainableModel`] che
//! esponga i parametri per nome, faccia il forward e, dato `∂loss/∂logits`,
//! produca i gradienti in due modalità:
//!
//! - **batched**: un gradiente per parametro (somma sulle righe ricevute);
//! - **per-sample**: un gradiente per esempio, con una dimensione di batch in
//!   testa `(B, ...S)`.
//!
//! Il modello registra gli input visti nel forward (pattern recorder) e li usa
//! nel backward successivo.

use ndarray::{Array1, Array2, Array3, Axis, Ix1, Ix2};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::error::{DpError, Result};
use crate::ParamMap;

/// Modello addestrabile con supporto ai gradienti per-sample.
pub trait TrainableModel {
    /// Tipo del singolo input.
    type Input;

    /// Parametri del modello per nome.
    fn parameters(&self) -> &ParamMap;

    /// Accesso mutabile ai parametri (step dell'ottimizzatore, rumore DP).
    fn parameters_mut(&mut self) -> &mut ParamMap;

    /// Forward su un batch: restituisce i logit `(B, classi)`.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se gli input non sono compatibili col modello.
    fn forward(&mut self, inputs: &[Self::Input]) -> Result<Array2<f32>>;

    /// Backward batched: gradiente di `Σ_i ⟨grad_logits_i, logits_i⟩`.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se non c'è un forward registrato compatibile.
    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap>;

    /// Backward per-sample: il gradiente di ogni riga separatamente.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se non c'è un forward registrato compatibile.
    fn backward_per_sample(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap>;
}

/// Nome del parametro dei pesi di [`LinearClassifier`].
pub const WEIGHT: &str = "weight";
/// Nome del parametro di bias di [`LinearClassifier`].
pub const BIAS: &str = "bias";

/// Regressione softmax: `logits = x · Wᵀ + b`.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    params: ParamMap,
    features: usize,
    classes: usize,
    recorded: Option<Array2<f32>>,
}

impl LinearClassifier {
    /// Modello con tutti i parametri a zero.
    #[must_use]
    pub fn zeros(features: usize, classes: usize) -> Self {
        Self::build(
            Array2::zeros((classes, features)),
            Array1::zeros(classes),
        )
    }

    /// Inizializzazione uniforme in `±1/√features`.
    ///
    /// # Errori
    ///
    /// [`DpError::Configuration`] se `features == 0`.
    pub fn random<R: Rng + ?Sized>(features: usize, classes: usize, rng: &mut R) -> Result<Self> {
        if features == 0 {
            return Err(DpError::config("linear classifier needs at least one feature"));
        }
        let bound = 1.0 / (features as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound)
            .map_err(|e| DpError::config(format!("invalid init range: {e}")))?;

        let weight = Array2::from_shape_simple_fn((classes, features), || dist.sample(rng));
        let bias = Array1::from_shape_simple_fn(classes, || dist.sample(rng));
        Ok(Self::build(weight, bias))
    }

    /// Costruisce il modello da pesi `(classi, feature)` e bias `(classi,)`.
    ///
    /// # Errori
    ///
    /// [`DpError::Configuration`] se le shape non sono coerenti.
    pub fn from_parameters(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(DpError::config(format!(
                "weight has {} classes but bias has {}",
                weight.nrows(),
                bias.len()
            )));
        }
        Ok(Self::build(weight, bias))
    }

    fn build(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        let (classes, features) = weight.dim();
        let mut params = ParamMap::new();
        params.insert(WEIGHT.to_string(), weight.into_dyn());
        params.insert(BIAS.to_string(), bias.into_dyn());
        Self {
            params,
            features,
            classes,
            recorded: None,
        }
    }

    /// Numero di feature in ingresso.
    #[must_use]
    pub fn features(&self) -> usize {
        self.features
    }

    /// Numero di classi in uscita.
    #[must_use]
    pub fn classes(&self) -> usize {
        self.classes
    }

    fn weight(&self) -> Result<Array2<f32>> {
        self.params
            .get(WEIGHT)
            .ok_or_else(|| DpError::state("missing weight parameter"))?
            .view()
            .into_dimensionality::<Ix2>()
            .map(|w| w.to_owned())
            .map_err(|e| DpError::state(format!("weight is not a matrix: {e}")))
    }

    fn bias(&self) -> Result<Array1<f32>> {
        self.params
            .get(BIAS)
            .ok_or_else(|| DpError::state("missing bias parameter"))?
            .view()
            .into_dimensionality::<Ix1>()
            .map(|b| b.to_owned())
            .map_err(|e| DpError::state(format!("bias is not a vector: {e}")))
    }

    fn recorded_for(&self, grad_logits: &Array2<f32>) -> Result<&Array2<f32>> {
        let x = self
            .recorded
            .as_ref()
            .ok_or_else(|| DpError::state("backward called before forward"))?;
        if grad_logits.dim() != (x.nrows(), self.classes) {
            return Err(DpError::state(format!(
                "grad_logits shape {:?} does not match recorded batch ({}, {})",
                grad_logits.dim(),
                x.nrows(),
                self.classes
            )));
        }
        Ok(x)
    }
}

impl TrainableModel for LinearClassifier {
    type Input = Array1<f32>;

    fn parameters(&self) -> &ParamMap {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamMap {
        &mut self.params
    }

    fn forward(&mut self, inputs: &[Self::Input]) -> Result<Array2<f32>> {
        if let Some(bad) = inputs.iter().find(|x| x.len() != self.features) {
            return Err(DpError::state(format!(
                "input has {} features, model expects {}",
                bad.len(),
                self.features
            )));
        }
        let x = Array2::from_shape_fn((inputs.len(), self.features), |(i, k)| inputs[i][k]);
        let logits = x.dot(&self.weight()?.t()) + &self.bias()?;
        self.recorded = Some(x);
        Ok(logits)
    }

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap> {
        let x = self.recorded_for(grad_logits)?;
        let mut grads = ParamMap::new();
        grads.insert(WEIGHT.to_string(), grad_logits.t().dot(x).into_dyn());
        grads.insert(BIAS.to_string(), grad_logits.sum_axis(Axis(0)).into_dyn());
        Ok(grads)
    }

    fn backward_per_sample(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap> {
        let x = self.recorded_for(grad_logits)?;
        let (batch, classes) = grad_logits.dim();
        let weight = Array3::from_shape_fn((batch, classes, self.features), |(i, c, k)| {
            grad_logits[[i, c]] * x[[i, k]]
        });
        let mut grads = ParamMap::new();
        grads.insert(WEIGHT.to_string(), weight.into_dyn());
        grads.insert(BIAS.to_string(), grad_logits.clone().into_dyn());
        Ok(grads)
    }
}
