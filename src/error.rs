use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    #[error("No debug adapter running for session: {0}")]
    ProxyNotRunning(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Python not found: {0}")]
    PythonNotFound(String),

    #[error("Debug adapter exited early: {0}")]
    AdapterExitedEarly(String),

    #[error("DAP request timed out: {0}")]
    DapTimeout(String),

    #[error("DAP error: {0}")]
    Dap(String),

    #[error("Child session unavailable: {0}")]
    ChildSessionUnavailable(String),

    #[error("Worker initialization failed: {0}")]
    WorkerInitCritical(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::SessionNotFound(_) => -32001,
            Error::SessionTerminated(_) => -32002,
            Error::ProxyNotRunning(_) => -32003,
            Error::InvalidParameters(_) => -32602,
            Error::UnsupportedLanguage(_) => -32004,
            Error::FileNotFound(_) => -32005,
            Error::ExecutableNotFound(_) | Error::PythonNotFound(_) => -32006,
            Error::AdapterExitedEarly(_) => -32007,
            Error::DapTimeout(_) => -32008,
            Error::Dap(_) => -32009,
            Error::ChildSessionUnavailable(_) => -32010,
            Error::WorkerInitCritical(_) => -32011,
            Error::Process(_) => -32012,
            Error::InvalidState(_) => -32013,
            Error::Io(_) | Error::Json(_) | Error::Internal(_) => -32603,
        }
    }

    /// Stable kind tag surfaced as `errorType` on tool results.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionTerminated(_) => "session_terminated",
            Error::ProxyNotRunning(_) => "proxy_not_running",
            Error::InvalidParameters(_) => "invalid_parameters",
            Error::UnsupportedLanguage(_) => "unsupported_language",
            Error::FileNotFound(_) => "file_not_found",
            Error::ExecutableNotFound(_) => "executable_not_found",
            Error::PythonNotFound(_) => "python_not_found",
            Error::AdapterExitedEarly(_) => "adapter_exit_early",
            Error::DapTimeout(_) => "dap_request_timeout",
            Error::Dap(_) => "dap_request_failed",
            Error::ChildSessionUnavailable(_) => "child_session_unavailable",
            Error::WorkerInitCritical(_) => "worker_init_critical",
            Error::Process(_) => "process_error",
            Error::InvalidState(_) => "invalid_state",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Internal(_) => "internal_error",
        }
    }
}
