//! Error types for the process interface and struct layout layers

use thiserror::Error;

/// Errors crossing the backend boundary or raised by the host-side
/// introspection layer. Every variant carries a human-readable message;
/// nothing in this layer panics or lets a native failure escape as anything
/// but a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterfaceError {
    /// The operating system denied or failed a native call.
    #[error("OS error: {0}")]
    Os(String),

    /// The backend shared library could not be opened.
    #[error("Failed to load backend library: {0}")]
    Load(String),

    /// A required entry point is missing from the backend library.
    #[error("Backend entry point not found: {0}")]
    Symbol(String),

    /// `init_interface` returned null.
    #[error("Backend initialization failed: {0}")]
    Init(String),

    /// The backend reports an ABI version the host does not understand.
    #[error("Backend ABI version mismatch: host {host}, backend {backend}")]
    VersionMismatch { host: u32, backend: u32 },

    /// Malformed on-disk or in-memory structure (PE/ELF headers, RTTI
    /// metadata, addresses outside the sane range).
    #[error("Parse error: {0}")]
    Parse(String),

    /// An operation that requires a loaded backend was called without one.
    #[error("No process interface loaded")]
    NotLoaded,

    /// An operation that requires an attached process was called detached.
    #[error("No process attached")]
    NotAttached,

    /// A handle was null or already closed.
    #[error("Invalid process handle: {0}")]
    InvalidHandle(String),
}

/// Result type alias for backend-boundary and introspection operations
pub type IfaceResult<T> = Result<T, InterfaceError>;

impl InterfaceError {
    /// Creates an OS error from a short operation description plus detail.
    pub fn os(op: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        InterfaceError::Os(format!("{}: {}", op.into(), detail))
    }

    /// Creates a parse error for an address that failed the per-bitness
    /// validity check.
    pub fn invalid_address(what: &str, address: u64) -> Self {
        InterfaceError::Parse(format!("Invalid {what} address: {address:#X}"))
    }
}

/// Errors raised by the struct/field layout model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectError {
    #[error("Struct not found: {0}")]
    StructNotFound(String),

    #[error("Field not found by id {0}")]
    FieldIdNotFound(u64),

    #[error("Field not found by name {0}")]
    FieldNameNotFound(String),

    #[error("Stale field handle for id {0}: struct changed since the handle was taken")]
    StaleHandle(u64),

    #[error("Replacing field {id} needs {needed} more bytes but the field list is exhausted")]
    OutOfSpace { id: u64, needed: usize },

    #[error("Struct already exists: {0}")]
    DuplicateStruct(String),

    #[error("Malformed struct document: {0}")]
    Document(String),
}

/// Result type alias for layout-model operations
pub type ProjectResult<T> = Result<T, ProjectError>;
