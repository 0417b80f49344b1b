//! Tassonomia degli errori per gli update locali con Differential Privacy.
//!
//! Nessun errore di questo crate è transitorio: il core non fa I/O di rete,
//! quindi ritentare la stessa chiamata con gli stessi input fallisce di nuovo.

use thiserror::Error;

/// Errori prodotti dal core DP.
#[derive(Debug, Error)]
pub enum DpError {
    /// Configurazione non valida (parametri DP, iperparametri, partizione vuota).
    ///
    /// Rilevata in modo eager alla costruzione della sessione.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Parametro fuori dominio passato a un noise sampler (ε ≤ 0, δ ∉ (0,1)).
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Violazione del contratto tra trainer e collaboratore esterno
    /// (shape dei gradienti per-sample, label fuori range, ecc.).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Errore di lettura del file di configurazione.
    #[error("unable to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Errore di parsing YAML della configurazione.
    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DpError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

/// Alias di `Result` per il core DP.
pub type Result<T> = std::result::Result<T, DpError>;
