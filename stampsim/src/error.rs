//! Error types for stamp rendering.
//!
//! Every failure in the engine surfaces as a [`StampError`]. Object-level
//! failures are wrapped with the object index (and stamp center when known) so
//! a batch log can attribute them; batch-level failures record the first stamp
//! of the chunk that aborted.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StampError>;

#[derive(Error, Debug)]
pub enum StampError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid type {0} for noise")]
    UnknownNoiseType(String),

    #[error("unknown draw_method {0}")]
    UnknownDrawMethod(String),

    #[error("invalid type {0} for wcs")]
    UnknownWcsType(String),

    #[error("unknown type {type_name} for {key}")]
    UnknownProfileType { key: String, type_name: String },

    #[error(
        "whitening already added more noise ({current}) than requested {noise_type} noise ({requested})"
    )]
    NoiseConflict {
        noise_type: &'static str,
        requested: f64,
        current: f64,
    },

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("drawing needs an FFT of size {required}, larger than the maximum {maximum}")]
    FftTooLarge { required: usize, maximum: usize },

    #[error("photon shooting needs {required} photons, more than the maximum {maximum}")]
    TooManyPhotons { required: f64, maximum: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("obj {obj_num}{location}: {source}")]
    Object {
        obj_num: usize,
        location: String,
        source: Box<StampError>,
    },

    #[error("stamp worker {0} panicked")]
    WorkerPanicked(usize),

    #[error("exception caught during job starting with stamp {start}: {source}")]
    Worker {
        start: usize,
        source: Box<StampError>,
    },
}

impl StampError {
    pub fn config(msg: impl Into<String>) -> Self {
        StampError::Config(msg.into())
    }

    /// Strip the object and worker context wrappers.
    pub fn root_cause(&self) -> &StampError {
        match self {
            StampError::Object { source, .. } | StampError::Worker { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
