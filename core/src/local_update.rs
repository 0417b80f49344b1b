//! Sessione di training locale di un client federato, con DP opzionale.
//!
//! Per ogni epoca la partizione viene mescolata dal generatore iniettato e
//! iterata a batch. Per ogni batch:
//!
//! 1. forward e cross-entropy media sui logit;
//! 2. backward batched (`no_dp`) oppure per-sample (meccanismi privati);
//! 3. clipping per-sample, L1 per Laplace e L2 per i gaussiani;
//! 4. step di SGD con momentum, poi un passo di decadimento del learning rate;
//! 5. rumore calibrato sulla sensibilità del learning rate **corrente**,
//!    aggiunto direttamente ai parametri (il momentum non viene toccato).
//!
//! La loss finale è la media delle medie per epoca.

use rand::Rng;
use tracing::{debug, info, warn};

use crate::accountant::{calibrate_noise_multiplier, RdpAccountant};
use crate::clip::PerSampleClipper;
use crate::config::{DpMechanism, LocalUpdateConfig};
use crate::data::{Dataset, DatasetSplit};
use crate::error::{DpError, Result};
use crate::loss::cross_entropy;
use crate::model::TrainableModel;
use crate::noise::NoiseSampler;
use crate::optim::{MomentumSgd, StepLr};
use crate::sensitivity::sensitivity;
use crate::ParamMap;

/// Esito di una sessione di update locale.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// Parametri finali (stesse chiavi e shape di quelli in ingresso).
    pub params: ParamMap,
    /// Media delle loss medie per epoca.
    pub loss: f64,
    /// Learning rate dopo l'ultimo passo di decadimento.
    pub lr: f64,
    /// Loss media di ogni epoca, in ordine.
    pub epoch_losses: Vec<f64>,
    /// Numero di iniezioni di rumore eseguite (0 per `no_dp`).
    pub noise_releases: usize,
}

/// Parte privata della sessione: clipper e calibrazione del rumore.
#[derive(Debug, Clone, Copy)]
struct PrivacyEngine {
    mechanism: DpMechanism,
    clipper: PerSampleClipper,
    epsilon: f64,
    delta: f64,
    clip: f64,
    noise_multiplier: Option<f64>,
}

impl PrivacyEngine {
    /// Sampler calibrato per il learning rate corrente.
    fn sampler(&self, lr: f64, dataset_size: usize) -> Result<NoiseSampler> {
        let sens = sensitivity(lr, self.clip, dataset_size)?;
        match (self.mechanism, self.noise_multiplier) {
            (DpMechanism::Laplace, _) => NoiseSampler::laplace(self.epsilon, sens),
            (DpMechanism::Gaussian, _) => NoiseSampler::gaussian_simple(self.epsilon, self.delta, sens),
            (DpMechanism::MomentsAccountant, Some(z)) => NoiseSampler::gaussian_moment(z, sens),
            (DpMechanism::MomentsAccountant, None) => {
                Err(DpError::state("moments accountant without a calibrated noise multiplier"))
            }
            (DpMechanism::NoDp, _) => Err(DpError::state("noise requested for no_dp session")),
        }
    }
}

/// Update locale di un client su una partizione di un dataset condiviso.
///
/// La configurazione è validata in costruzione: una sessione costruita con
/// successo fallisce solo per violazioni di contratto del modello.
#[derive(Debug)]
pub struct LocalUpdate<'a, D> {
    config: LocalUpdateConfig,
    split: DatasetSplit<'a, D>,
    privacy: Option<PrivacyEngine>,
}

impl<'a, D: Dataset> LocalUpdate<'a, D> {
    /// Prepara una sessione.
    ///
    /// Per `MA` il noise multiplier viene calibrato qui, una volta sola, con
    /// `sample_rate = local_bs / |partizione|` e
    /// `steps = local_ep × batch_per_epoca`.
    ///
    /// # Errori
    ///
    /// [`DpError::Configuration`] per iperparametri o parametri DP non validi,
    /// partizione vuota o con indici fuori dal dataset.
    pub fn new(config: LocalUpdateConfig, dataset: &'a D, idxs: Vec<usize>) -> Result<Self> {
        config.validate()?;
        let split = DatasetSplit::new(dataset, idxs)?;
        let n = split.len();

        if config.momentum >= 1.0 {
            warn!(momentum = config.momentum, "momentum >= 1, updates may diverge");
        }
        if config.local_bs > n {
            warn!(
                local_bs = config.local_bs,
                partition = n,
                "batch size exceeds partition, one batch per epoch"
            );
        }

        let privacy = match config.dp_mechanism.clip_norm() {
            None => None,
            Some(norm) => {
                // Sensibilità al learning rate iniziale: scarta subito le combinazioni degeneri.
                sensitivity(config.lr, config.dp_clip, n)?;
                let clipper = PerSampleClipper::new(config.dp_clip, norm)?;

                let noise_multiplier = if config.dp_mechanism == DpMechanism::MomentsAccountant {
                    let sample_rate = (config.local_bs as f64 / n as f64).min(1.0);
                    let steps = config.local_ep * split.batches_per_epoch(config.local_bs);
                    let z = calibrate_noise_multiplier(
                        config.dp_epsilon,
                        config.dp_delta,
                        sample_rate,
                        steps,
                    )?;

                    let mut accountant = RdpAccountant::new();
                    accountant.compose(z, sample_rate, steps);
                    info!(
                        noise_multiplier = z,
                        sample_rate,
                        steps,
                        epsilon = accountant.epsilon(config.dp_delta),
                        "moments accountant calibrated"
                    );
                    Some(z)
                } else {
                    None
                };

                Some(PrivacyEngine {
                    mechanism: config.dp_mechanism,
                    clipper,
                    epsilon: config.dp_epsilon,
                    delta: config.dp_delta,
                    clip: config.dp_clip,
                    noise_multiplier,
                })
            }
        };

        Ok(Self {
            config,
            split,
            privacy,
        })
    }

    /// Configurazione della sessione.
    #[must_use]
    pub fn config(&self) -> &LocalUpdateConfig {
        &self.config
    }

    /// Partizione locale.
    #[must_use]
    pub fn split(&self) -> &DatasetSplit<'a, D> {
        &self.split
    }

    /// Noise multiplier calibrato (solo per `MA`).
    #[must_use]
    pub fn noise_multiplier(&self) -> Option<f64> {
        self.privacy.and_then(|p| p.noise_multiplier)
    }

    /// Esegue `local_ep` epoche sul modello, mutandone i parametri in-place.
    ///
    /// In caso di errore il modello resta nello stato parzialmente aggiornato.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se il modello viola il contratto di
    /// [`TrainableModel`] (shape dei gradienti, label fuori range, ...).
    pub fn train<M, R>(&self, model: &mut M, rng: &mut R) -> Result<UpdateOutcome>
    where
        M: TrainableModel<Input = D::Sample>,
        R: Rng + ?Sized,
    {
        let cfg = &self.config;
        let n = self.split.len();

        info!(
            mechanism = %cfg.dp_mechanism,
            samples = n,
            epochs = cfg.local_ep,
            batch_size = cfg.local_bs,
            lr = cfg.lr,
            "local update started"
        );

        let mut optimizer = MomentumSgd::new(cfg.lr, cfg.momentum);
        let mut scheduler = StepLr::new(cfg.lr_decay);
        let mut epoch_losses = Vec::with_capacity(cfg.local_ep);
        let mut noise_releases = 0_usize;

        for epoch in 0..cfg.local_ep {
            let mut batch_losses = Vec::with_capacity(self.split.batches_per_epoch(cfg.local_bs));

            for (batch_idx, batch) in self.split.batches(cfg.local_bs, rng).enumerate() {
                let batch = batch?;
                let logits = model.forward(&batch.inputs)?;
                let ce = cross_entropy(&logits, &batch.labels)?;

                let grads = match &self.privacy {
                    None => model.backward(&ce.mean_grad_logits())?,
                    Some(engine) => {
                        let per_sample = model.backward_per_sample(&ce.grad_logits)?;
                        let clipped = engine.clipper.clip(per_sample, batch.len())?;
                        debug!(
                            epoch,
                            batch = batch_idx,
                            clipped = clipped.clipped_samples,
                            max_norm = clipped.norms.fold(0.0_f32, |m, &x| m.max(x)),
                            "per-sample gradients clipped"
                        );
                        clipped.gradients
                    }
                };

                optimizer.step(model.parameters_mut(), &grads)?;
                scheduler.step(&mut optimizer);

                if let Some(engine) = &self.privacy {
                    let sampler = engine.sampler(optimizer.lr(), n)?;
                    for param in model.parameters_mut().values_mut() {
                        let noise = sampler.sample(param.shape(), rng);
                        *param += &noise;
                    }
                    noise_releases += 1;
                }

                debug!(epoch, batch = batch_idx, loss = ce.mean, lr = optimizer.lr(), "batch done");
                batch_losses.push(f64::from(ce.mean));
            }

            let epoch_loss = mean(&batch_losses);
            info!(epoch, loss = epoch_loss, lr = optimizer.lr(), "epoch done");
            epoch_losses.push(epoch_loss);
        }

        let loss = mean(&epoch_losses);
        info!(
            loss,
            lr = optimizer.lr(),
            steps = scheduler.steps(),
            noise_releases,
            "local update finished"
        );

        Ok(UpdateOutcome {
            params: model.parameters().clone(),
            loss,
            lr: optimizer.lr(),
            epoch_losses,
            noise_releases,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryDataset;
    use crate::model::{LinearClassifier, BIAS, WEIGHT};
    use ndarray::{arr1, Array2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Due blob separabili: classe 0 intorno a (-1, -1), classe 1 intorno a (1, 1).
    fn blobs(n: usize) -> InMemoryDataset {
        let features = (0..n)
            .map(|i| {
                let sign = if i % 2 == 0 { -1.0 } else { 1.0 };
                let jitter = (i as f32) * 0.01;
                arr1(&[sign + jitter, sign - jitter])
            })
            .collect();
        let labels = (0..n).map(|i| i % 2).collect();
        InMemoryDataset::new(features, labels).unwrap()
    }

    fn config(mechanism: DpMechanism) -> LocalUpdateConfig {
        LocalUpdateConfig {
            local_ep: 2,
            local_bs: 4,
            lr: 0.1,
            momentum: 0.5,
            lr_decay: 0.9,
            dp_mechanism: mechanism,
            ..LocalUpdateConfig::default()
        }
    }

    #[test]
    fn single_batch_no_dp_reports_batch_loss_and_decayed_lr() {
        let ds = blobs(6);
        let cfg = LocalUpdateConfig {
            local_ep: 1,
            local_bs: 10,
            ..config(DpMechanism::NoDp)
        };
        let update = LocalUpdate::new(cfg, &ds, (0..6).collect()).unwrap();
        let mut model = LinearClassifier::zeros(2, 2);
        let mut rng = StdRng::seed_from_u64(7);

        let out = update.train(&mut model, &mut rng).unwrap();

        // Pesi nulli: logit uniformi, loss = ln 2.
        assert!((out.loss - 2.0_f64.ln()).abs() < 1.0e-6);
        assert_eq!(out.epoch_losses.len(), 1);
        assert!((out.lr - 0.1 * 0.9).abs() < 1.0e-12);
        assert_eq!(out.noise_releases, 0);
    }

    #[test]
    fn no_dp_equals_plain_sgd_step() {
        let ds = blobs(8);
        let cfg = LocalUpdateConfig {
            local_ep: 1,
            local_bs: 8,
            ..config(DpMechanism::NoDp)
        };
        let update = LocalUpdate::new(cfg, &ds, (0..8).collect()).unwrap();

        let mut init_rng = StdRng::seed_from_u64(3);
        let mut model = LinearClassifier::random(2, 2, &mut init_rng).unwrap();
        let mut reference = model.clone();

        let inputs: Vec<_> = (0..8).map(|i| ds.get(i).unwrap().0).collect();
        let labels: Vec<_> = (0..8).map(|i| ds.get(i).unwrap().1).collect();
        let logits = reference.forward(&inputs).unwrap();
        let ce = cross_entropy(&logits, &labels).unwrap();
        let grads = reference.backward(&ce.mean_grad_logits()).unwrap();
        let mut expected = reference.parameters().clone();
        for (name, param) in &mut expected {
            param.zip_mut_with(&grads[name], |p, &g| *p -= 0.1 * g);
        }

        let mut rng = StdRng::seed_from_u64(11);
        let out = update.train(&mut model, &mut rng).unwrap();

        for name in [WEIGHT, BIAS] {
            for (a, b) in out.params[name].iter().zip(expected[name].iter()) {
                assert!((a - b).abs() < 1.0e-6, "{name}: {a} vs {b}");
            }
        }
        assert!((out.loss - f64::from(ce.mean)).abs() < 1.0e-6);
    }

    #[test]
    fn loss_is_mean_of_epoch_means_and_lr_decays_per_batch() {
        let ds = blobs(10);
        let cfg = LocalUpdateConfig {
            local_ep: 3,
            local_bs: 4,
            ..config(DpMechanism::NoDp)
        };
        let update = LocalUpdate::new(cfg, &ds, (0..10).collect()).unwrap();
        let mut model = LinearClassifier::zeros(2, 2);
        let mut rng = StdRng::seed_from_u64(1);

        let out = update.train(&mut model, &mut rng).unwrap();

        assert_eq!(out.epoch_losses.len(), 3);
        let expected = out.epoch_losses.iter().sum::<f64>() / 3.0;
        assert!((out.loss - expected).abs() < 1.0e-12);
        // 3 batch per epoca (4 + 4 + 2), un passo di decadimento per batch.
        assert!((out.lr - 0.1 * 0.9_f64.powi(9)).abs() < 1.0e-12);
        // I blob sono separabili: la loss scende.
        assert!(out.epoch_losses[2] < out.epoch_losses[0]);
    }

    #[test]
    fn private_mechanisms_are_deterministic_for_a_seed() {
        let ds = blobs(12);
        for mechanism in [
            DpMechanism::Laplace,
            DpMechanism::Gaussian,
            DpMechanism::MomentsAccountant,
        ] {
            let update = LocalUpdate::new(config(mechanism), &ds, (0..12).collect()).unwrap();
            let run = |seed| {
                let mut model = LinearClassifier::zeros(2, 2);
                let mut rng = StdRng::seed_from_u64(seed);
                update.train(&mut model, &mut rng).unwrap()
            };

            let a = run(99);
            let b = run(99);
            assert_eq!(a.params, b.params, "{mechanism}");
            assert_eq!(a.noise_releases, 2 * 3, "{mechanism}");
            assert!(a.params.values().all(|p| p.iter().all(|x| x.is_finite())));
            assert!(a.loss.is_finite());
        }
    }

    #[test]
    fn noise_perturbs_parameters() {
        let ds = blobs(8);
        let plain = LocalUpdate::new(config(DpMechanism::NoDp), &ds, (0..8).collect()).unwrap();
        let noisy = LocalUpdate::new(config(DpMechanism::Laplace), &ds, (0..8).collect()).unwrap();

        let mut a = LinearClassifier::zeros(2, 2);
        let mut b = LinearClassifier::zeros(2, 2);
        let out_plain = plain.train(&mut a, &mut StdRng::seed_from_u64(5)).unwrap();
        let out_noisy = noisy.train(&mut b, &mut StdRng::seed_from_u64(5)).unwrap();

        assert_ne!(out_plain.params, out_noisy.params);
    }

    #[test]
    fn moments_accountant_calibrates_once() {
        let ds = blobs(20);
        let ma = LocalUpdate::new(config(DpMechanism::MomentsAccountant), &ds, (0..20).collect())
            .unwrap();
        let z = ma.noise_multiplier().unwrap();
        assert!(z > 0.0 && z.is_finite());

        let plain = LocalUpdate::new(config(DpMechanism::Gaussian), &ds, (0..20).collect()).unwrap();
        assert!(plain.noise_multiplier().is_none());
    }

    #[test]
    fn invalid_sessions_fail_at_construction() {
        let ds = blobs(4);

        let no_delta = LocalUpdateConfig {
            dp_delta: 0.0,
            ..config(DpMechanism::Gaussian)
        };
        assert!(matches!(
            LocalUpdate::new(no_delta, &ds, vec![0, 1]).unwrap_err(),
            DpError::Configuration(_)
        ));
        assert!(matches!(
            LocalUpdate::new(config(DpMechanism::NoDp), &ds, vec![]).unwrap_err(),
            DpError::Configuration(_)
        ));
        assert!(LocalUpdate::new(config(DpMechanism::Laplace), &ds, vec![0, 9]).is_err());
        assert!(matches!(
            "Exponential".parse::<DpMechanism>().unwrap_err(),
            DpError::Configuration(_)
        ));
    }

    /// Modello che restituisce gradienti senza dimensione di batch.
    struct NoBatchDim(LinearClassifier);

    impl TrainableModel for NoBatchDim {
        type Input = ndarray::Array1<f32>;

        fn parameters(&self) -> &ParamMap {
            self.0.parameters()
        }

        fn parameters_mut(&mut self) -> &mut ParamMap {
            self.0.parameters_mut()
        }

        fn forward(&mut self, inputs: &[Self::Input]) -> Result<Array2<f32>> {
            self.0.forward(inputs)
        }

        fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap> {
            self.0.backward(grad_logits)
        }

        fn backward_per_sample(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap> {
            self.0.backward(grad_logits)
        }
    }

    /// Modello con gradienti sempre nulli: dopo lo step i parametri cambiano
    /// solo per il rumore iniettato.
    struct ZeroGradients(LinearClassifier);

    fn zeroed(grads: ParamMap) -> ParamMap {
        grads
            .into_iter()
            .map(|(name, g)| (name, ndarray::ArrayD::zeros(g.raw_dim())))
            .collect()
    }

    impl TrainableModel for ZeroGradients {
        type Input = ndarray::Array1<f32>;

        fn parameters(&self) -> &ParamMap {
            self.0.parameters()
        }

        fn parameters_mut(&mut self) -> &mut ParamMap {
            self.0.parameters_mut()
        }

        fn forward(&mut self, inputs: &[Self::Input]) -> Result<Array2<f32>> {
            self.0.forward(inputs)
        }

        fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap> {
            self.0.backward(grad_logits).map(zeroed)
        }

        fn backward_per_sample(&mut self, grad_logits: &Array2<f32>) -> Result<ParamMap> {
            self.0.backward_per_sample(grad_logits).map(zeroed)
        }
    }

    /// Varianza empirica di tutte le entrate dei parametri (media teorica 0).
    fn injected_variance(mechanism: DpMechanism, seed: u64) -> (f64, Option<f64>) {
        const FEATURES: usize = 100;
        const CLASSES: usize = 100;

        let features = (0..4).map(|_| ndarray::Array1::zeros(FEATURES)).collect();
        let ds = InMemoryDataset::new(features, vec![0, 1, 2, 3]).unwrap();
        let cfg = LocalUpdateConfig {
            local_ep: 1,
            local_bs: 4,
            lr: 0.1,
            momentum: 0.0,
            lr_decay: 0.5,
            dp_mechanism: mechanism,
            dp_epsilon: 1.0,
            dp_delta: 1.0e-5,
            dp_clip: 1.0,
        };
        let update = LocalUpdate::new(cfg, &ds, (0..4).collect()).unwrap();
        let mut model = ZeroGradients(LinearClassifier::zeros(FEATURES, CLASSES));
        let out = update
            .train(&mut model, &mut StdRng::seed_from_u64(seed))
            .unwrap();
        assert_eq!(out.noise_releases, 1);

        let (sum_sq, count) = out
            .params
            .values()
            .flat_map(|p| p.iter())
            .fold((0.0_f64, 0_usize), |(s, c), &x| (s + f64::from(x).powi(2), c + 1));
        (sum_sq / count as f64, update.noise_multiplier())
    }

    #[test]
    fn noise_scale_follows_decayed_learning_rate() {
        // Un solo batch: lr dopo il decadimento = 0.1 · 0.5, n = 4, C = 1.
        let sens = sensitivity(0.1 * 0.5, 1.0, 4).unwrap();

        let (laplace, _) = injected_variance(DpMechanism::Laplace, 21);
        let b = sens / 1.0;
        let expected = 2.0 * b * b;
        assert!(
            (laplace / expected - 1.0).abs() < 0.1,
            "laplace variance {laplace}, expected {expected}"
        );

        let (gaussian, _) = injected_variance(DpMechanism::Gaussian, 22);
        let sigma = sens * (2.0 * (1.25_f64 / 1.0e-5).ln()).sqrt() / 1.0;
        assert!(
            (gaussian / (sigma * sigma) - 1.0).abs() < 0.1,
            "gaussian variance {gaussian}, expected {}",
            sigma * sigma
        );

        let (moments, z) = injected_variance(DpMechanism::MomentsAccountant, 23);
        let sigma = z.unwrap() * sens;
        assert!(
            (moments / (sigma * sigma) - 1.0).abs() < 0.1,
            "moments variance {moments}, expected {}",
            sigma * sigma
        );
    }

    #[test]
    fn per_sample_contract_violation_is_invalid_state() {
        let ds = blobs(3);
        let cfg = LocalUpdateConfig {
            local_bs: 3,
            ..config(DpMechanism::Gaussian)
        };
        let update = LocalUpdate::new(cfg, &ds, vec![0, 1, 2]).unwrap();
        let mut model = NoBatchDim(LinearClassifier::zeros(2, 2));
        let err = update
            .train(&mut model, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, DpError::InvalidState(_)));
    }
}
