//! Error types shared by every part of the hosting-capacity engine.

use thiserror::Error;

/// Errors raised by the engine, its collaborators, and their file formats.
///
/// Per-trial problems (solver non-convergence, violations) are not errors:
/// they travel in result flags and violation reports. Only configuration
/// problems, lookup failures, and programming errors end up here.
#[derive(Error, Debug)]
pub enum HcaError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// File access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The circuit description could not be interpreted.
    #[error("circuit error: {0}")]
    Circuit(String),

    /// A CSV table could not be read or written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A JSON snapshot could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML document could not be parsed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A bus name is not part of the feeder graph.
    #[error("bus `{0}` not found in feeder graph")]
    BusNotFound(String),

    /// A named element is not part of the feeder graph or solver session.
    #[error("{class} `{name}` not found")]
    ElementNotFound { class: String, name: String },

    /// The bisection was entered with inconsistent bounds.
    #[error("bisection corner: {0}")]
    BisectionCorner(String),

    /// Random bus sampling found nothing left to visit.
    #[error("no candidate buses remain for resource `{0}`")]
    NoCandidateBus(String),

    /// A rating ladder has no step above the current rating.
    #[error("no catalog step above {rating} kVA for {phases}-phase transformers")]
    CatalogExhausted { rating: f64, phases: usize },

    /// The baseline result has already been frozen.
    #[error("baseline result is already set and cannot be overwritten")]
    BaselineFrozen,

    /// A snapshot was written by an incompatible format version.
    #[error("incompatible snapshot format {found} (expected {expected})")]
    IncompatibleSnapshot { found: u32, expected: u32 },

    /// The simulator rejected a command or request.
    #[error("solver error: {0}")]
    Solver(String),
}

/// Convenience alias for results carrying [`HcaError`].
pub type Result<T> = std::result::Result<T, HcaError>;

impl HcaError {
    /// Builds an [`HcaError::ElementNotFound`] from a class and a name.
    pub fn element_not_found(class: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ElementNotFound {
            class: class.into(),
            name: name.into(),
        }
    }
}
