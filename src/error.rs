use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration errors. Anything raised here aborts the run before output is written.
#[derive(Debug, Error)]
pub(crate) enum ShakeError {
    #[error("root class not found in input: {0}")]
    MissingRootClass(String),
    #[error("root class {0} has no main method")]
    RootHasNoEntryMethod(String),
    #[error("output file should be of jar type: {}", .0.display())]
    MalformedOutputTarget(PathBuf),
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),
}
