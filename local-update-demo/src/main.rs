#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

//! Eseguibile di demo per dpfed.
//!
//! Genera un dataset sintetico a due blob, lo divide tra alcuni client e
//! lancia un update locale sul primo client con ciascun meccanismo DP,
//! stampando loss, learning rate finale e norma dei pesi.
//!
//! Uso:
//!
//! ```text
//! local-update-demo [config.yaml]
//! ```
//!
//! Senza argomenti la configurazione viene letta dalle variabili `DPFED_*`.
//! Il livello di log si controlla con `RUST_LOG` (es. `RUST_LOG=debug`).

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dpfed_core::{
    DpMechanism, InMemoryDataset, LinearClassifier, LocalUpdate, LocalUpdateConfig,
};

const SAMPLES: usize = 600;
const FEATURES: usize = 4;
const CLIENTS: usize = 3;
const SEED: u64 = 2024;

/// Due gaussiane isotrope centrate in `-1` e `+1`, label 0 e 1.
fn two_blobs(rng: &mut StdRng) -> Result<InMemoryDataset> {
    let noise = Normal::new(0.0_f32, 0.8).context("invalid blob spread")?;
    let mut features = Vec::with_capacity(SAMPLES);
    let mut labels = Vec::with_capacity(SAMPLES);
    for i in 0..SAMPLES {
        let label = i % 2;
        let center = if label == 0 { -1.0 } else { 1.0 };
        features.push(Array1::from_shape_fn(FEATURES, |_| center + noise.sample(rng)));
        labels.push(label);
    }
    Ok(InMemoryDataset::new(features, labels)?)
}

/// Partizione iid: indici mescolati e divisi in parti uguali.
fn iid_partitions(rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut idxs: Vec<usize> = (0..SAMPLES).collect();
    idxs.shuffle(rng);
    idxs.chunks(SAMPLES / CLIENTS).map(<[usize]>::to_vec).collect()
}

fn load_config() -> Result<LocalUpdateConfig> {
    match env::args().nth(1).map(PathBuf::from) {
        Some(path) => LocalUpdateConfig::from_yaml(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => LocalUpdateConfig::from_env().context("failed to load config from environment"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base = load_config()?;
    let mut rng = StdRng::seed_from_u64(SEED);
    let dataset = two_blobs(&mut rng)?;
    let partitions = iid_partitions(&mut rng);
    let client = partitions
        .first()
        .cloned()
        .context("no client partition generated")?;

    info!(
        samples = SAMPLES,
        clients = CLIENTS,
        client_samples = client.len(),
        "synthetic federation ready"
    );

    println!("dpfed: demo update locale");
    println!(
        "{:<10} {:>10} {:>12} {:>12} {:>8}",
        "mechanism", "loss", "final lr", "|weight|", "noise"
    );

    for mechanism in [
        DpMechanism::NoDp,
        DpMechanism::Laplace,
        DpMechanism::Gaussian,
        DpMechanism::MomentsAccountant,
    ] {
        let cfg = LocalUpdateConfig {
            dp_mechanism: mechanism,
            ..base.clone()
        };
        let update = LocalUpdate::new(cfg, &dataset, client.clone())
            .with_context(|| format!("invalid session for {mechanism}"))?;

        let mut init_rng = StdRng::seed_from_u64(SEED);
        let mut model = LinearClassifier::random(FEATURES, 2, &mut init_rng)?;
        let mut train_rng = StdRng::seed_from_u64(SEED + 1);
        let outcome = update
            .train(&mut model, &mut train_rng)
            .with_context(|| format!("local update with {mechanism} failed"))?;

        let weight_norm = outcome
            .params
            .get(dpfed_core::model::WEIGHT)
            .map_or(0.0, |w| w.iter().map(|x| x * x).sum::<f32>().sqrt());

        println!(
            "{:<10} {:>10.4} {:>12.6} {:>12.4} {:>8}",
            mechanism.as_str(),
            outcome.loss,
            outcome.lr,
            weight_norm,
            outcome.noise_releases
        );
    }

    Ok(())
}
