use thiserror::Error;

/// Everything that can abort a compile. Every variant is fatal: once raised,
/// the sink's current contents are not a valid image.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("file too large for this format: {0}")]
    TooLargeForFormat(String),

    #[error("requested size {requested} is below the minimum of {minimum}")]
    SizeBelowMinimum { requested: u64, minimum: u64 },

    #[error("geometry infeasible: {0}")]
    GeometryInfeasible(String),

    #[error("invalid call for current compiler state: {0}")]
    StateError(String),

    #[error("compile cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt input tree: {0}")]
    CorruptInput(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;
