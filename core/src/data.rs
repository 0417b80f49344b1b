//! Partizione locale del dataset e batching.
//!
//! Il caricamento del dataset è esterno: qui c'è solo il minimo per vedere
//! la partizione del client come una sequenza di sample e iterarla a batch in
//! un ordine deciso da un RNG iniettato.

use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{DpError, Result};

/// Dataset indicizzabile per chiave intera.
pub trait Dataset {
    /// Tipo del singolo input (es. un vettore di feature).
    type Sample: Clone;

    /// Numero di record nel dataset.
    fn len(&self) -> usize;

    /// `true` se il dataset è vuoto.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restituisce `(input, label)` del record `idx`, se esiste.
    fn get(&self, idx: usize) -> Option<(Self::Sample, usize)>;
}

/// Dataset in memoria: un vettore di feature e una label per record.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    features: Vec<Array1<f32>>,
    labels: Vec<usize>,
}

impl InMemoryDataset {
    /// Crea il dataset.
    ///
    /// # Errori
    ///
    /// [`DpError::Configuration`] se feature e label hanno lunghezze diverse.
    pub fn new(features: Vec<Array1<f32>>, labels: Vec<usize>) -> Result<Self> {
        if features.len() != labels.len() {
            return Err(DpError::config(format!(
                "{} feature rows but {} labels",
                features.len(),
                labels.len()
            )));
        }
        Ok(Self { features, labels })
    }
}

impl Dataset for InMemoryDataset {
    type Sample = Array1<f32>;

    fn len(&self) -> usize {
        self.features.len()
    }

    fn get(&self, idx: usize) -> Option<(Self::Sample, usize)> {
        Some((self.features.get(idx)?.clone(), *self.labels.get(idx)?))
    }
}

/// Vista della partizione di un client su un dataset condiviso.
///
/// Gli indici sono immutabili per tutta la sessione.
#[derive(Debug)]
pub struct DatasetSplit<'a, D> {
    dataset: &'a D,
    idxs: Vec<usize>,
}

impl<'a, D: Dataset> DatasetSplit<'a, D> {
    /// Crea la partizione.
    ///
    /// # Errori
    ///
    /// [`DpError::Configuration`] se la partizione è vuota o contiene indici
    /// fuori dal dataset.
    pub fn new(dataset: &'a D, idxs: Vec<usize>) -> Result<Self> {
        if idxs.is_empty() {
            return Err(DpError::config("client partition is empty"));
        }
        let len = dataset.len();
        if let Some(&bad) = idxs.iter().find(|&&i| i >= len) {
            return Err(DpError::config(format!(
                "partition index {bad} out of range for dataset of {len} records"
            )));
        }
        Ok(Self { dataset, idxs })
    }

    /// Numero di sample nella partizione.
    #[must_use]
    pub fn len(&self) -> usize {
        self.idxs.len()
    }

    /// Sempre `false`: una partizione vuota viene rifiutata in costruzione.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.idxs.is_empty()
    }

    /// Indici della partizione, nell'ordine del chiamante.
    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.idxs
    }

    /// Sample `item`-esimo della partizione.
    ///
    /// # Errori
    ///
    /// [`DpError::InvalidState`] se il dataset non restituisce il record.
    pub fn get(&self, item: usize) -> Result<(D::Sample, usize)> {
        let idx = *self
            .idxs
            .get(item)
            .ok_or_else(|| DpError::state(format!("partition item {item} out of range")))?;
        self.dataset
            .get(idx)
            .ok_or_else(|| DpError::state(format!("dataset has no record {idx}")))
    }

    /// Numero di batch per epoca con la batch size data.
    #[must_use]
    pub fn batches_per_epoch(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// Iteratore sui batch di un'epoca, in ordine mescolato da `rng`.
    ///
    /// L'ultimo batch può essere più corto di `batch_size`.
    pub fn batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> BatchLoader<'_, 'a, D> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        BatchLoader {
            split: self,
            order,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

/// Un batch: input e label allineati.
#[derive(Debug, Clone)]
pub struct Batch<S> {
    /// Input del batch.
    pub inputs: Vec<S>,
    /// Label di classe, una per input.
    pub labels: Vec<usize>,
}

impl<S> Batch<S> {
    /// Numero effettivo di sample nel batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// `true` se il batch non ha sample.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Iteratore a batch su una [`DatasetSplit`].
#[derive(Debug)]
pub struct BatchLoader<'s, 'a, D> {
    split: &'s DatasetSplit<'a, D>,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<D: Dataset> Iterator for BatchLoader<'_, '_, D> {
    type Item = Result<Batch<D::Sample>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let positions = &self.order[self.cursor..end];
        self.cursor = end;

        let mut inputs = Vec::with_capacity(positions.len());
        let mut labels = Vec::with_capacity(positions.len());
        for &pos in positions {
            match self.split.get(pos) {
                Ok((input, label)) => {
                    inputs.push(input);
                    labels.push(label);
                }
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(Batch { inputs, labels }))
    }
}
