//! Typed failures for model construction. The hot path (`progress`,
//! `progress_matrix`, similarity queries) never returns `Result` — out of
//! range ids degrade to `NaN` / `ContextId(0)` as required by spec.md §7.

use thiserror::Error;

/// Failures that can occur while parsing and validating a serialized model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("corrupt model: {0}")]
    CorruptModel(String),

    #[error("unsupported quantization: qbit={qbit}, window={window}, key_size={key_size}")]
    UnsupportedQuant {
        qbit: u8,
        window: u8,
        key_size: u8,
    },

    #[error("no matching SIMD implementation and fp32 fallback unavailable for op {op}")]
    UnsupportedArch { op: &'static str },

    #[error("value {value} is out of range for encoder with bias {bias}")]
    EncodeRange { value: u64, bias: u64 },

    #[error("unsupported primitive size {size}, expected 8 or 16")]
    UnsupportedSize { size: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
