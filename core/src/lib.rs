//! dpfed core: update locali con Differential Privacy per client federati.
//!
//! Il crate implementa la parte "client" di un round di Federated Learning:
//! dato un modello, una partizione locale del dataset e una configurazione,
//! [`LocalUpdate`] esegue alcune epoche di SGD con momentum e, se richiesto,
//! rende l'update differenzialmente privato con:
//!
//! - clipping per-sample dei gradienti (L1 per Laplace, L2 per i gaussiani),
//! - rumore calibrato sulla sensibilità `2 · lr · C / n` aggiunto ai parametri
//!   dopo ogni step,
//! - calibrazione del noise multiplier con un accountant RDP (meccanismo `MA`).
//!
//! # Panoramica
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │            LocalUpdate               │
//! │  DatasetSplit ──► BatchLoader        │  shuffle con RNG iniettato
//! │  TrainableModel ──► cross_entropy    │  forward + loss
//! │  PerSampleClipper                    │  clip + media sul batch
//! │  MomentumSgd + StepLr                │  step + decadimento lr
//! │  NoiseSampler ◄── sensitivity        │  rumore sui parametri
//! └──────────────────────────────────────┘
//! ```
//!
//! L'orchestrazione tra client (selezione, aggregazione) è esterna al crate.

#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::collections::BTreeMap;

use ndarray::ArrayD;

/// Calcolo della sensibilità dell'update.
pub mod sensitivity;
/// Sampler di rumore Laplace e gaussiano.
pub mod noise;
/// Accountant RDP e calibrazione del noise multiplier.
pub mod accountant;
/// Clipping per-sample dei gradienti.
pub mod clip;
/// Cross-entropy sui logit.
pub mod loss;
/// Dataset, partizione del client e batching.
pub mod data;
/// Trait del modello addestrabile e classificatore lineare.
pub mod model;
/// SGD con momentum e scheduler del learning rate.
pub mod optim;
/// Configurazione della sessione (YAML / env).
pub mod config;
/// Sessione di training locale.
pub mod local_update;
/// Errori del crate.
pub mod error;

/// Tensore di parametri o gradienti, con shape dinamica.
pub type Tensor = ArrayD<f32>;

/// Parametri (o gradienti) per nome, in ordine deterministico.
///
/// L'ordine delle chiavi fissa anche l'ordine in cui il rumore viene
/// campionato, quindi una sessione con seed fisso è riproducibile.
pub type ParamMap = BTreeMap<String, Tensor>;

pub use accountant::{calibrate_noise_multiplier, RdpAccountant};
pub use clip::{ClipNorm, ClippedBatch, PerSampleClipper};
pub use config::{DpMechanism, LocalUpdateConfig};
pub use data::{Batch, BatchLoader, Dataset, DatasetSplit, InMemoryDataset};
pub use error::{DpError, Result};
pub use local_update::{LocalUpdate, UpdateOutcome};
pub use loss::{cross_entropy, CrossEntropyOutput};
pub use model::{LinearClassifier, TrainableModel};
pub use noise::NoiseSampler;
pub use optim::{MomentumSgd, StepLr};
pub use sensitivity::sensitivity;
