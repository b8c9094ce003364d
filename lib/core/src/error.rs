use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed level, threshold or probability input, detected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Function '{function}' is not supported by the {dialect} dialect")]
    UnsupportedFunction { function: String, dialect: String },

    /// A probability left [0, 1] or lambda became non-finite after an update
    #[error("Model state error: {0}")]
    ModelState(String),

    #[error("Corrupted state: {0}")]
    CorruptedState(String),

    #[error("Sampling infeasible: {0}")]
    SamplingInfeasible(String),

    #[error("Query execution failed: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn unsupported(function: impl Into<String>, dialect: impl Into<String>) -> Self {
        Error::UnsupportedFunction {
            function: function.into(),
            dialect: dialect.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
