use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use log::{debug, error, warn};
use walkdir::WalkDir;

/// File names that mark a directory as the source of an image.
pub const BUILD_DESCRIPTORS: &[&str] = &["Dockerfile", "Containerfile"];

/// Maps image names to the directory holding their build descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagePaths(BTreeMap<String, PathBuf>);

impl ImagePaths {
    /// Walks `work_dir` and records every directory containing a build descriptor under its base name.
    pub fn discover(work_dir: &Path) -> io::Result<Self> {
        let work_dir = work_dir.canonicalize()?;
        let mut paths = BTreeMap::new();

        for entry in WalkDir::new(&work_dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let dir = entry.path();
            if !BUILD_DESCRIPTORS
                .iter()
                .any(|descriptor| dir.join(descriptor).is_file())
            {
                continue;
            }
            let Some(name) = dir.file_name() else {
                continue;
            };
            let name = name.to_string_lossy().into_owned();
            debug!("found image {name:?} in {}", dir.display());
            if let Some(previous) = paths.insert(name.clone(), dir.to_owned()) {
                warn!(
                    "image {name:?} is defined in both {} and {}, using the latter",
                    previous.display(),
                    dir.display()
                );
            }
        }

        Ok(Self(paths))
    }

    pub fn get(&self, name: &str) -> Option<&Path> {
        self.0.get(name).map(PathBuf::as_path)
    }

    /// Returns the source directory of the image, or an empty path when it is unknown. Building from the empty path
    /// fails in the build tool, which is where the error surfaces.
    pub fn resolve(&self, name: &str) -> &Path {
        self.get(name).unwrap_or_else(|| {
            error!("no source directory with a Dockerfile or Containerfile found for image {name:?}");
            Path::new("")
        })
    }

    /// The names without a known source directory.
    pub fn missing<'a, I: IntoIterator<Item = &'a str>>(&self, names: I) -> Vec<&'a str> {
        names
            .into_iter()
            .filter(|name| !self.0.contains_key(*name))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.0.iter().map(|(name, path)| (name.as_str(), path.as_path()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<N: Into<String>, P: Into<PathBuf>> FromIterator<(N, P)> for ImagePaths {
    fn from_iter<T: IntoIterator<Item = (N, P)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, path)| (name.into(), path.into()))
                .collect(),
        )
    }
}
