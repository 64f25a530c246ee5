//! Error types for the engine binary.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration or experiment definition loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: vcweb_core::ConfigError,
    },

    /// The experiment definition file does not exist.
    #[error("experiment definition not found at {path}")]
    MissingDefinition {
        /// Path that was tried.
        path: String,
    },

    /// Building or driving the experiment failed.
    #[error("experiment error: {source}")]
    Experiment {
        /// The underlying experiment error.
        #[from]
        source: vcweb_core::ExperimentError,
    },

    /// The archive database failed.
    #[error("database error: {source}")]
    Db {
        /// The underlying database error.
        #[from]
        source: vcweb_db::DbError,
    },
}
