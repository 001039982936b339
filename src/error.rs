//! Error types for Runway.
//!
//! Every failure that can reach a caller is a variant of [`Error`]. The
//! HTTP layer renders these through their `Display` text, so the messages
//! below are part of the public response contract.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Runway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Runway.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Validation Errors
    // ========================================================================
    /// Neither a private key nor a password was supplied.
    #[error("must set keyfile or password")]
    MissingCredential,

    /// A module that needs arguments was invoked without any.
    #[error("No argument passed to '{module}' module.")]
    MissingModuleArgs {
        /// Module name
        module: String,
    },

    /// Playbook file does not exist.
    #[error("Not Found the playbook file: {}.", .0.display())]
    PlaybookNotFound(PathBuf),

    /// Playbook exists but could not be understood.
    #[error("Failed to parse playbook '{path}': {message}")]
    PlaybookParse {
        /// Path to the playbook file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Request is structurally invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // ========================================================================
    // Inventory Errors
    // ========================================================================
    /// Inventory has no hosts after deduplication.
    #[error("Inventory is empty.")]
    EmptyInventory,

    /// Host pattern resolved to nothing.
    #[error("pattern: {0} does not match any hosts.")]
    NoMatchingHosts(String),

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Unexpected failure inside an execution engine.
    #[error("Execution failed: {0}")]
    Execution(String),

    // ========================================================================
    // Directory Service Errors
    // ========================================================================
    /// Directory service answered with an unexpected HTTP status.
    #[error("Directory service returned {status} for '{url}': {body}")]
    DirectoryResponse {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Directory service reported a query failure in its payload.
    #[error("Directory query failed: {note}")]
    DirectoryQuery {
        /// `err_note` returned by the service
        note: String,
    },

    /// Directory service could not be reached or decoded.
    #[error("Directory request failed: {0}")]
    DirectoryTransport(#[from] reqwest::Error),

    // ========================================================================
    // Access Errors
    // ========================================================================
    /// Current user is on the inventory denylist.
    #[error("user '{user}' is not allowed to query the inventory")]
    AccessDenied {
        /// Denied user name
        user: String,
    },

    // ========================================================================
    // IO and Serialization Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error with source.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a new missing module arguments error.
    pub fn missing_module_args(module: impl Into<String>) -> Self {
        Self::MissingModuleArgs {
            module: module.into(),
        }
    }

    /// Creates a new playbook parse error.
    pub fn playbook_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::PlaybookParse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new directory query error.
    pub fn directory_query(note: impl Into<String>) -> Self {
        Self::DirectoryQuery { note: note.into() }
    }

    /// Returns true if the error was raised before any remote work began.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingCredential
                | Error::MissingModuleArgs { .. }
                | Error::PlaybookNotFound(_)
                | Error::PlaybookParse { .. }
                | Error::InvalidRequest(_)
        )
    }

    /// Returns the error code for CLI exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::DirectoryResponse { .. }
            | Error::DirectoryQuery { .. }
            | Error::DirectoryTransport(_) => 2,
            Error::Config(_) => 3,
            _ => 1,
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: format!("{}: {}", message.into(), e),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: format!("{}: {}", f().into(), e),
            source: Some(Box::new(e)),
        })
    }
}
