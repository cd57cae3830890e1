mod buildah;

pub use buildah::*;

use serde::Serialize;

use crate::Result;

/// What happened to an image that was handed to a [`Builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Generated {
    /// The image is excluded and was not touched.
    Excluded,
    Built,
    BuiltAndPushed,
}

impl std::fmt::Display for Generated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Generated::Excluded => "excluded",
            Generated::Built => "built",
            Generated::BuiltAndPushed => "built and pushed",
        })
    }
}

pub trait Builder: Send + Sync {
    /// Builds the named image, and pushes it if the builder is configured to do so.
    fn generate(&self, name: &str) -> Result<Generated>;
}
