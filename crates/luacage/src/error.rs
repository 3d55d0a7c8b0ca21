/// Errors surfaced by a sandbox instance.
///
/// Script-originated variants carry the VM's own error text, which
/// usually includes a source line annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// Compilation failed; message from the VM.
    Syntax(String),
    /// Runtime error inside the script, including runtime-quota
    /// exhaustion and errors raised by host callables.
    Script(String),
    /// A VM allocation was refused because the memory ceiling was
    /// exceeded. The instance is poisoned afterwards; only `close`
    /// remains useful.
    OutOfMemory(String),
    /// Marshalling failed: recursion depth exceeded or a value of an
    /// unsupported type crossed the boundary.
    Serialization(String),
    /// An execution is already in flight on this instance.
    Busy,
    /// The instance has been closed.
    Closed,
    /// Invariant violation inside the sandbox plumbing.
    Internal(String),
}

pub type SandboxResult<T> = Result<T, SandboxError>;

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::Syntax(msg) => write!(f, "syntax error: {}", msg),
            SandboxError::Script(msg) => write!(f, "script error: {}", msg),
            SandboxError::OutOfMemory(msg) => write!(f, "out of memory: {}", msg),
            SandboxError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            SandboxError::Busy => write!(f, "execution already in progress on this sandbox"),
            SandboxError::Closed => write!(f, "sandbox has been closed"),
            SandboxError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for SandboxError {}

impl SandboxError {
    /// Returns the carried message, or a static description for the
    /// message-less variants.
    pub fn message(&self) -> &str {
        match self {
            SandboxError::Syntax(msg)
            | SandboxError::Script(msg)
            | SandboxError::OutOfMemory(msg)
            | SandboxError::Serialization(msg)
            | SandboxError::Internal(msg) => msg,
            SandboxError::Busy => "execution already in progress",
            SandboxError::Closed => "sandbox has been closed",
        }
    }

    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, SandboxError::OutOfMemory(_))
    }

    /// Translate a VM-side error into the sandbox taxonomy.
    ///
    /// Callback errors are unwrapped to their cause first so a
    /// serialization failure inside a host upcall keeps its kind
    /// instead of degrading to a generic script error.
    pub(crate) fn from_lua(err: mlua::Error) -> SandboxError {
        SandboxError::translate(&err)
    }

    fn translate(err: &mlua::Error) -> SandboxError {
        match err {
            mlua::Error::SyntaxError { message, .. } => SandboxError::Syntax(message.clone()),
            mlua::Error::MemoryError(message) => SandboxError::OutOfMemory(message.clone()),
            mlua::Error::ExternalError(cause) => cause
                .downcast_ref::<SandboxError>()
                .cloned()
                .unwrap_or_else(|| SandboxError::Script(err.to_string())),
            mlua::Error::CallbackError { cause, .. } => match SandboxError::translate(cause) {
                // keep the full text (with traceback) for plain script errors
                SandboxError::Script(_) => SandboxError::Script(err.to_string()),
                other => other,
            },
            _ => SandboxError::Script(err.to_string()),
        }
    }
}

// Lets sandbox errors cross into the VM as error objects and come
// back out intact through `from_lua`.
impl From<SandboxError> for mlua::Error {
    fn from(err: SandboxError) -> Self {
        mlua::Error::external(err)
    }
}
