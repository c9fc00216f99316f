use std::path::PathBuf;

use thiserror::Error;

/// An invalid project definition. Always fatal: surfaced before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read project definition at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse project definition: {0}")]
    Parse(String),

    #[error("Project name must not be empty")]
    EmptyName,

    #[error("Project '{project}' declares no modules")]
    NoModules { project: String },

    #[error("Project '{project}' does not define features; add a 'features' section to use feature-by-feature")]
    NoFeatures { project: String },

    #[error("Duplicate unit id '{id}'")]
    DuplicateUnit { id: String },

    #[error("Unknown dependency '{dependency}' in unit '{unit}'")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Feature '{feature}' touches unknown module '{module}'")]
    UnknownModule { feature: String, module: String },

    #[error("{0}")]
    Invalid(String),
}
