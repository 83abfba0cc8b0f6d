use memkit_defer::CleanupError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error(transparent)]
pub struct Error(Box<ErrorKind>);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.0.as_ref()
    }

    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    pub fn out_of_memory(requested: usize, reason: impl Into<String>) -> Error {
        Error(
            ErrorKind::OutOfMemory {
                requested,
                reason: reason.into(),
            }
            .into(),
        )
    }

    pub fn invalid_arg(name: impl Into<String>, message: impl Into<String>) -> Error {
        Error(
            ErrorKind::InvalidArgument {
                name: name.into(),
                message: message.into(),
            }
            .into(),
        )
    }

    pub fn invalid_operation(name: impl Into<String>) -> Error {
        Error(ErrorKind::InvalidOperation { name: name.into() }.into())
    }

    pub fn index_out_of_bounds(index: usize, len: usize) -> Error {
        Error(ErrorKind::IndexOutOfBounds { index, len }.into())
    }

    pub fn disposed(what: &'static str) -> Error {
        Error(ErrorKind::Disposed { what }.into())
    }

    pub fn foreign_block(allocator: impl Into<String>, address: usize) -> Error {
        Error(
            ErrorKind::ForeignBlock {
                allocator: allocator.into(),
                address,
            }
            .into(),
        )
    }

    pub fn double_free(allocator: impl Into<String>, address: usize) -> Error {
        Error(
            ErrorKind::DoubleFree {
                allocator: allocator.into(),
                address,
            }
            .into(),
        )
    }

    pub fn unsupported(allocator: impl Into<String>, operation: &'static str) -> Error {
        Error(
            ErrorKind::Unsupported {
                allocator: allocator.into(),
                operation,
            }
            .into(),
        )
    }

    pub fn leak(allocator: impl Into<String>, count: usize, first: impl Into<String>) -> Error {
        Error(
            ErrorKind::Leak {
                allocator: allocator.into(),
                count,
                first: first.into(),
            }
            .into(),
        )
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Error {
        Error(
            ErrorKind::Io {
                context: context.into(),
                source,
            }
            .into(),
        )
    }

    /// Programmer errors: the caller broke the allocation contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument { .. }
                | ErrorKind::IndexOutOfBounds { .. }
                | ErrorKind::Disposed { .. }
                | ErrorKind::ForeignBlock { .. }
                | ErrorKind::DoubleFree { .. }
        )
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.kind(), ErrorKind::OutOfMemory { .. })
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("out of memory allocating {requested} bytes: {reason}")]
    OutOfMemory { requested: usize, reason: String },

    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("invalid operation {name}")]
    InvalidOperation { name: String },

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("{what} used after it was disposed")]
    Disposed { what: &'static str },

    #[error("allocator '{allocator}' did not issue block at {address:#x}")]
    ForeignBlock { allocator: String, address: usize },

    #[error("double free of block at {address:#x} in allocator '{allocator}'")]
    DoubleFree { allocator: String, address: usize },

    #[error("allocator '{allocator}' does not support {operation}")]
    Unsupported {
        allocator: String,
        operation: &'static str,
    },

    #[error("allocator '{allocator}' leaked {count} allocation(s), first at {first}")]
    Leak {
        allocator: String,
        count: usize,
        first: String,
    },

    #[error("cleanup failed: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("IO error for '{context}': {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error(kind.into())
    }
}

impl From<CleanupError> for Error {
    fn from(e: CleanupError) -> Self {
        ErrorKind::Cleanup(e).into()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::io("", e)
    }
}

impl From<std::alloc::LayoutError> for Error {
    fn from(e: std::alloc::LayoutError) -> Self {
        Error::invalid_arg("layout", e.to_string())
    }
}
