//! Sensibilità dell'update clippato e mediato.
//!
//! Dopo il clipping per-sample ogni esempio contribuisce al passo SGD al
//! massimo `lr * clip / n`; cambiare un esempio sposta quindi i parametri di
//! al più `2 * lr * clip / n`. La stessa formula vale per il meccanismo L1
//! (Laplace) e L2 (Gaussiano), perché è il clipping a fissare la norma.

use crate::error::{DpError, Result};

/// Calcola la sensibilità `2 * lr * clip / dataset_size`.
///
/// # Errori
///
/// [`DpError::Configuration`] se `dataset_size == 0`.
pub fn sensitivity(lr: f64, clip: f64, dataset_size: usize) -> Result<f64> {
    if dataset_size == 0 {
        return Err(DpError::config(
            "dataset size must be > 0 to compute sensitivity",
        ));
    }
    Ok(2.0 * lr * clip / dataset_size as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sensitivity_known_value() {
        let s = sensitivity(0.1, 20.0, 600).unwrap();
        assert!((s - 2.0 * 0.1 * 20.0 / 600.0).abs() < 1.0e-12);
    }

    #[test]
    fn zero_dataset_size_is_configuration_error() {
        let err = sensitivity(0.1, 1.0, 0).unwrap_err();
        assert!(matches!(err, DpError::Configuration(_)));
    }

    proptest! {
        #[test]
        fn sensitivity_matches_formula(
            lr in 1.0e-6_f64..10.0,
            clip in 1.0e-6_f64..100.0,
            n in 1_usize..1_000_000,
        ) {
            let s = sensitivity(lr, clip, n).unwrap();
            let expected = 2.0 * lr * clip / n as f64;
            prop_assert!((s - expected).abs() <= 1.0e-12 * expected.max(1.0));
        }
    }
}
