// src/error.rs

//! Crate-wide error taxonomy
//!
//! Concretization errors are all-or-nothing: any unsatisfiable node aborts
//! the whole request with the conflicting constraint set attached. Build
//! errors are recovered per node by the orchestrator and reported together.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed abstract spec text; fails fast, never reaches the concretizer
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Package name not known to the metadata repository
    #[error("Unknown package '{0}'")]
    UnknownPackage(String),

    /// Constraint intersection came up empty for a package
    #[error("Unsatisfiable spec for '{package}': no assignment satisfies {}", conflicts.join(" and "))]
    UnsatisfiableSpec {
        package: String,
        /// The minimal conflicting constraint set, rendered for the user
        conflicts: Vec<String>,
    },

    /// Virtual package expansion revisited a provider already on the stack
    #[error("Cyclic virtual dependency on '{virtual_name}': {}", chain.join(" -> "))]
    CyclicVirtualDependency {
        virtual_name: String,
        chain: Vec<String>,
    },

    /// Concrete dependency graphs must be acyclic
    #[error("Dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A package has no declared version admissible under its constraint
    #[error("No valid version for '{package}' satisfying {constraint}")]
    NoValidVersion { package: String, constraint: String },

    /// Variant value outside the declared legal set, or an undeclared variant
    #[error("Invalid variant '{variant}' for '{package}': {reason}")]
    InvalidVariant {
        package: String,
        variant: String,
        reason: String,
    },

    /// No configured compiler satisfies the node's compiler constraint
    #[error("No configured compiler satisfies {constraint}")]
    NoSuchCompiler { constraint: String },

    /// Registry hash-prefix lookup matched more than one spec
    #[error("Hash prefix '{prefix}' is ambiguous: matches {}", matches.join(", "))]
    AmbiguousHashPrefix {
        prefix: String,
        matches: Vec<String>,
    },

    /// Registry hash-prefix lookup matched nothing
    #[error("No spec matches hash prefix '{0}'")]
    NoSuchHash(String),

    /// Source archive failed verification during staging
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// A node's build step failed; the captured log travels with the report
    #[error("Build of '{package}' failed: {cause}")]
    BuildFailed { package: String, cause: String },

    /// A node was never started because a dependency failed
    #[error("'{package}' blocked by failed dependency '{root_cause}'")]
    Blocked {
        package: String,
        root_cause: String,
    },

    /// The expansion fixpoint failed to settle; indicates pathological metadata
    #[error("Solver error: {0}")]
    SolverError(String),

    /// Configuration file or value rejected
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
