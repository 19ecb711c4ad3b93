use thiserror::Error;

/// Everything that can go wrong while compiling a module.
///
/// The `Display` form is the single user-visible diagnostic: one string
/// describing the first problem, with byte-offset position information.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Malformed binary reported by the decoder or up-front validator,
    /// surfaced unchanged.
    #[error("decode error: {0}")]
    Decode(#[from] wasmparser::BinaryReaderError),

    /// The single pass observed an operand stack that contradicts the
    /// opcode metadata (underflow, kind mismatch, bad block result).
    #[error("parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    /// An operand offset would not fit the bytecode's offset encoding.
    #[error("function at offset {position} needs a frame larger than the operand encoding allows")]
    FrameTooLarge { position: usize },

    /// Instruction outside the supported feature set.
    #[error("unsupported instruction at offset {position}: {name}")]
    Unsupported { position: usize, name: String },
}

impl CompileError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        CompileError::Parse {
            position,
            message: message.into(),
        }
    }
}
