//! Clipping per-sample dei gradienti.
//!
//! Il clipper riceve, per ogni parametro, un tensore con una dimensione di
//! batch in testa `(B, ...S)` e:
//!
//! 1. calcola la norma **globale** di ogni sample su tutti i parametri,
//!    `norm_i = (Σ_param ‖g[param][i]‖_p^p)^(1/p)`;
//! 2. divide lo slice `i` di ogni parametro per `max(1, norm_i / C)`;
//! 3. media sul batch, restituendo un gradiente per parametro.
//!
//! La riduzione della norma è fatta per tensore (una somma sugli assi interni
//! per parametro), non sample per sample.

use ndarray::{Array1, Axis, Ix1};

use crate::error::{DpError, Result};
use crate::ParamMap;

/// Norma usata per il clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipNorm {
    /// Norma L1, accoppiata al meccanismo di Laplace.
    L1,
    /// Norma L2, accoppiata ai meccanismi gaussiani.
    L2,
}

impl ClipNorm {
    fn power(self, x: f64) -> f64 {
        match self {
            Self::L1 => x.abs(),
            Self::L2 => x * x,
        }
    }

    fn root(self, sum: f64) -> f64 {
        match self {
            Self::L1 => sum,
            Self::L2 => sum.sqrt(),
        }
    }
}

/// Risultato di un clipping su un batch.
#[derive(Debug, Clone)]
pub struct ClippedBatch {
    /// Gradiente mediato per parametro, pronto per l'ottimizzatore.
    pub gradients: ParamMap,
    /// Norme per-sample prima del clipping.
    pub norms: Array1<f32>,
    /// Quanti sample sono stati effettivamente riscalati.
    pub clipped_samples: usize,
}

/// Clipper per-sample con bound `C` e norma `p`.
#[derive(Debug, Clone, Copy)]
pub struct PerSampleClipper {
    bound: f32,
    norm: ClipNorm,
}

impl PerSampleClipper {
    /// Crea un clipper.
    ///
    /// # Errori
    ///
    /// [`DpError::Configuration`] se il bound non è positivo e finito.
    pub fn new(bound: f64, norm: ClipNorm) -> Result<Self> {
        if !(bound > 0.0 && bound.is_finite()) {
            return Err(DpError::config(format!(
                "clip bound must be > 0, got {bound}"
            )));
        }
        Ok(Self {
            bound: bound as f32,
            norm,
        })
    }

    /// Bound di clipping.
    #[must_use]
    pub fn bound(&self) -> f32 {
        self.bound
    }

    /// Norma usata.
    #[must_use]
    pub fn norm(&self) -> ClipNorm {
        self.norm
    }

    /// Norma globale di ogni sample del batch.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se un tensore non ha `batch_size` come
    /// dimensione di testa.
    pub fn sample_norms(&self, per_sample: &ParamMap, batch_size: usize) -> Result<Array1<f32>> {
        Ok(self.norms_f64(per_sample, batch_size)?.mapv(|n| n as f32))
    }

    /// Accumula in f64: in f32 `x²` va in overflow già per `|x| ≈ 1.8e19`.
    fn norms_f64(&self, per_sample: &ParamMap, batch_size: usize) -> Result<Array1<f64>> {
        check_batch(per_sample, batch_size)?;

        let mut totals = Array1::<f64>::zeros(batch_size);
        for grad in per_sample.values() {
            let mut acc = grad.mapv(|x| self.norm.power(f64::from(x)));
            while acc.ndim() > 1 {
                let last = Axis(acc.ndim() - 1);
                acc = acc.sum_axis(last);
            }
            let acc = acc
                .into_dimensionality::<Ix1>()
                .map_err(|e| DpError::state(format!("per-sample reduction failed: {e}")))?;
            totals += &acc;
        }

        Ok(totals.mapv(|s| self.norm.root(s)))
    }

    /// Clippa i gradienti per-sample e li media sul batch.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se le shape non sono coerenti con `batch_size`.
    pub fn clip(&self, mut per_sample: ParamMap, batch_size: usize) -> Result<ClippedBatch> {
        let norms = self.norms_f64(&per_sample, batch_size)?;
        let bound = f64::from(self.bound);
        let scales = norms.mapv(|n| (n / bound).max(1.0));
        let clipped_samples = scales.iter().filter(|&&s| s > 1.0).count();

        let mut gradients = ParamMap::new();
        for (name, grad) in &mut per_sample {
            for (mut slice, &scale) in grad.axis_iter_mut(Axis(0)).zip(scales.iter()) {
                if scale > 1.0 {
                    slice.mapv_inplace(|x| (f64::from(x) / scale) as f32);
                }
            }
            let mean = grad
                .mean_axis(Axis(0))
                .ok_or_else(|| DpError::state(format!("empty batch for parameter {name}")))?;
            gradients.insert(name.clone(), mean);
        }

        Ok(ClippedBatch {
            gradients,
            norms: norms.mapv(|n| n as f32),
            clipped_samples,
        })
    }
}

fn check_batch(per_sample: &ParamMap, batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(DpError::state("per-sample clipping needs a non-empty batch"));
    }
    for (name, grad) in per_sample {
        match grad.shape().first() {
            Some(&lead) if lead == batch_size => {}
            Some(&lead) => {
                return Err(DpError::state(format!(
                    "per-sample gradient for {name} has leading dimension {lead}, expected batch size {batch_size}"
                )));
            }
            None => {
                return Err(DpError::state(format!(
                    "per-sample gradient for {name} is a scalar, expected a batch dimension"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array2, Array3, ArrayD};
    use proptest::prelude::*;

    const TOL: f32 = 1.0e-5;

    fn params(w: Array3<f32>, b: Array2<f32>) -> ParamMap {
        let mut map = ParamMap::new();
        map.insert("weight".to_string(), w.into_dyn());
        map.insert("bias".to_string(), b.into_dyn());
        map
    }

    /// Batch da 4 con norme note [0.5, 2.0, 1.0, 0.0] su parametri (2,2) e (3,).
    fn known_batch() -> ParamMap {
        let mut w = Array3::<f32>::zeros((4, 2, 2));
        let mut b = Array2::<f32>::zeros((4, 3));
        // sample 0: 0.3² + 0.4² = 0.25 → 0.5
        w[[0, 0, 0]] = 0.3;
        b[[0, 1]] = 0.4;
        // sample 1: 1.2² + 1.6² = 4 → 2.0
        w[[1, 1, 1]] = 1.2;
        b[[1, 2]] = 1.6;
        // sample 2: esattamente sul bound
        w[[2, 0, 1]] = 1.0;
        // sample 3: tutto zero
        params(w, b)
    }

    #[test]
    fn known_norms_and_aggregated_mean() {
        let clipper = PerSampleClipper::new(1.0, ClipNorm::L2).unwrap();
        let batch = known_batch();

        let norms = clipper.sample_norms(&batch, 4).unwrap();
        for (n, expected) in norms.iter().zip([0.5, 2.0, 1.0, 0.0]) {
            assert!((n - expected).abs() < TOL);
        }

        let out = clipper.clip(batch, 4).unwrap();
        assert_eq!(out.clipped_samples, 1);

        // scale [1, 0.5, 1, 1]: sample 1 diventa (0.6, 0.8), poi media su 4.
        let w = &out.gradients["weight"];
        let expected_w = arr2(&[[0.3_f32 / 4.0, 1.0 / 4.0], [0.0, 0.6 / 4.0]]).into_dyn();
        let b = &out.gradients["bias"];
        let expected_b = arr1(&[0.0_f32, 0.4 / 4.0, 0.8 / 4.0]).into_dyn();

        assert_eq!(w.shape(), &[2, 2]);
        assert_eq!(b.shape(), &[3]);
        for (a, e) in w.iter().zip(expected_w.iter()) {
            assert!((a - e).abs() < TOL, "{a} vs {e}");
        }
        for (a, e) in b.iter().zip(expected_b.iter()) {
            assert!((a - e).abs() < TOL, "{a} vs {e}");
        }
    }

    #[test]
    fn l1_norm_sums_absolute_values() {
        let clipper = PerSampleClipper::new(1.0, ClipNorm::L1).unwrap();
        let mut map = ParamMap::new();
        map.insert(
            "w".to_string(),
            arr2(&[[1.0_f32, -2.0], [0.25, 0.25]]).into_dyn(),
        );
        map.insert("b".to_string(), arr1(&[-1.0_f32, 0.0]).into_dyn());

        let norms = clipper.sample_norms(&map, 2).unwrap();
        assert!((norms[0] - 4.0).abs() < TOL);
        assert!((norms[1] - 0.5).abs() < TOL);

        let out = clipper.clip(map, 2).unwrap();
        // sample 0 scalato di 1/4, sample 1 invariato.
        let w = &out.gradients["w"];
        assert!((w[[0]] - (0.25 + 0.25) / 2.0).abs() < TOL);
        assert!((w[[1]] - (-0.5 + 0.25) / 2.0).abs() < TOL);
    }

    #[test]
    fn zero_sample_does_not_divide_by_zero() {
        let clipper = PerSampleClipper::new(0.5, ClipNorm::L2).unwrap();
        let mut map = ParamMap::new();
        map.insert("w".to_string(), ArrayD::<f32>::zeros(vec![3, 4]));

        let out = clipper.clip(map, 3).unwrap();
        assert_eq!(out.clipped_samples, 0);
        assert!(out.gradients["w"].iter().all(|x| *x == 0.0));
    }

    #[test]
    fn leading_dimension_mismatch_is_invalid_state() {
        let clipper = PerSampleClipper::new(1.0, ClipNorm::L2).unwrap();
        let err = clipper.clip(known_batch(), 5).unwrap_err();
        assert!(matches!(err, DpError::InvalidState(_)));

        let mut scalar = ParamMap::new();
        scalar.insert("s".to_string(), ArrayD::<f32>::zeros(vec![]));
        assert!(matches!(
            clipper.clip(scalar, 1).unwrap_err(),
            DpError::InvalidState(_)
        ));

        assert!(matches!(
            clipper.clip(ParamMap::new(), 0).unwrap_err(),
            DpError::InvalidState(_)
        ));
    }

    #[test]
    fn huge_gradients_are_scaled_to_the_bound() {
        let clipper = PerSampleClipper::new(1.0, ClipNorm::L2).unwrap();
        let mut map = ParamMap::new();
        map.insert(
            "w".to_string(),
            arr2(&[[3.0e20_f32, 4.0e20], [0.3, 0.4]]).into_dyn(),
        );

        let norms = clipper.sample_norms(&map, 2).unwrap();
        assert!(norms[0].is_finite());
        assert!((norms[0] / 5.0e20 - 1.0).abs() < TOL);

        let out = clipper.clip(map, 2).unwrap();
        assert_eq!(out.clipped_samples, 1);
        // sample 0 diventa (0.6, 0.8), sample 1 resta (0.3, 0.4).
        let w = &out.gradients["w"];
        assert!((w[[0]] - 0.45).abs() < TOL, "{}", w[[0]]);
        assert!((w[[1]] - 0.6).abs() < TOL, "{}", w[[1]]);
    }

    #[test]
    fn non_positive_bound_is_configuration_error() {
        assert!(matches!(
            PerSampleClipper::new(0.0, ClipNorm::L2).unwrap_err(),
            DpError::Configuration(_)
        ));
        assert!(PerSampleClipper::new(f64::NAN, ClipNorm::L1).is_err());
    }

    fn batch_from(values: &[f32], batch: usize) -> ParamMap {
        let per = values.len() / batch;
        let w = ArrayD::from_shape_vec(vec![batch, per], values[..batch * per].to_vec()).unwrap();
        let mut map = ParamMap::new();
        map.insert("w".to_string(), w);
        map
    }

    proptest! {
        #[test]
        fn clipped_samples_never_exceed_bound(
            values in prop::collection::vec(-10.0_f32..10.0, 24),
            bound in 0.1_f64..5.0,
        ) {
            let clipper = PerSampleClipper::new(bound, ClipNorm::L2).unwrap();
            let batch = batch_from(&values, 4);
            let before = clipper.sample_norms(&batch, 4).unwrap();

            // Media di un solo sample = il sample clippato stesso.
            for i in 0..4 {
                let row = batch["w"].index_axis(Axis(0), i).to_owned().insert_axis(Axis(0));
                let mut single = ParamMap::new();
                single.insert("w".to_string(), row.clone());
                let out = clipper.clip(single, 1).unwrap();
                let after: f32 = out.gradients["w"].iter().map(|x| x * x).sum::<f32>().sqrt();

                if before[i] <= bound as f32 {
                    for (a, e) in out.gradients["w"].iter().zip(row.iter()) {
                        prop_assert!((a - e).abs() <= 1.0e-5);
                    }
                } else {
                    prop_assert!((after - bound as f32).abs() <= 1.0e-4 * bound as f32);
                }
            }
        }

        #[test]
        fn clip_then_average_is_permutation_invariant(
            values in prop::collection::vec(-5.0_f32..5.0, 30),
            bound in 0.1_f64..3.0,
        ) {
            let clipper = PerSampleClipper::new(bound, ClipNorm::L2).unwrap();
            let forward = batch_from(&values, 5);

            let per = values.len() / 5;
            let reversed: Vec<f32> = values
                .chunks(per)
                .rev()
                .flat_map(|c| c.iter().copied())
                .collect();
            let backward = batch_from(&reversed, 5);

            let a = clipper.clip(forward, 5).unwrap();
            let b = clipper.clip(backward, 5).unwrap();
            for (x, y) in a.gradients["w"].iter().zip(b.gradients["w"].iter()) {
                prop_assert!((x - y).abs() <= 1.0e-4);
            }
        }
    }
}
