use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    deps::Deps,
    destination::{InvalidDestination, Repository},
};

/// Four hours, large images on slow mirrors take a while.
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 4 * 60 * 60;
pub const DEFAULT_PRIVILEGE_PREFIX: &str = "sudo";
pub const DEFAULT_TOOL: &str = "buildah";
pub const DEFAULT_REGISTRY_ADDRESS: &str = "127.0.0.1:8787";

/// Everything one build run needs. Loaded from YAML, any field may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Tree that is searched for image source directories.
    pub work_dir: PathBuf,
    pub deps: Deps,
    pub base: String,
    pub image_type: String,
    pub tag: String,
    pub namespace: String,
    pub registry_address: String,
    pub push_containers: bool,
    /// Bind mounts passed to every build as `--volume`.
    pub volumes: Vec<String>,
    pub excludes: BTreeSet<String>,
    /// Seconds a single layer may take.
    pub build_timeout: u64,
    pub debug: bool,
    /// Command prepended to every build tool invocation, empty to run the tool directly.
    pub privilege_prefix: String,
    pub tool: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            deps: Deps::default(),
            base: "centos".to_owned(),
            image_type: "binary".to_owned(),
            tag: "latest".to_owned(),
            namespace: "tripleomaster".to_owned(),
            registry_address: DEFAULT_REGISTRY_ADDRESS.to_owned(),
            push_containers: true,
            volumes: Vec::new(),
            excludes: BTreeSet::new(),
            build_timeout: DEFAULT_BUILD_TIMEOUT_SECS,
            debug: false,
            privilege_prefix: DEFAULT_PRIVILEGE_PREFIX.to_owned(),
            tool: DEFAULT_TOOL.to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = read(path)?;
        serde_yaml::from_str(&contents).map_err(|source| Error::Yaml {
            path: path.to_owned(),
            source,
        })
    }

    pub fn repository(&self) -> Repository {
        Repository {
            registry: self.registry_address.clone(),
            namespace: self.namespace.clone(),
            base: self.base.clone(),
            image_type: self.image_type.clone(),
            tag: self.tag.clone(),
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.repository().validate()?;
        if self.build_timeout == 0 {
            return Err(Error::Invalid("build_timeout must be at least one second".to_owned()));
        }
        if self.tool.trim().is_empty() {
            return Err(Error::Invalid("tool must not be empty".to_owned()));
        }
        if let Some(volume) = self.volumes.iter().find(|volume| volume.trim().is_empty()) {
            return Err(Error::Invalid(format!("invalid volume {volume:?}")));
        }
        Ok(())
    }
}

/// Loads a dependency description from a JSON file if the extension says so, from YAML otherwise.
pub fn load_deps(path: &Path) -> Result<Deps, Error> {
    let contents = read(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&contents).map_err(|source| Error::Json {
            path: path.to_owned(),
            source,
        })
    } else {
        serde_yaml::from_str(&contents).map_err(|source| Error::Yaml {
            path: path.to_owned(),
            source,
        })
    }
}

fn read(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })
}

#[derive(Debug)]
pub enum Error {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    Destination(InvalidDestination),
    Invalid(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { path, source } => write!(f, "failed to read {}: {source}", path.display()),
            Error::Yaml { path, source } => {
                write!(f, "failed to parse {} as YAML: {source}", path.display())
            }
            Error::Json { path, source } => {
                write!(f, "failed to parse {} as JSON: {source}", path.display())
            }
            Error::Destination(error) => write!(f, "{error}"),
            Error::Invalid(message) => write!(f, "invalid configuration: {message}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            Error::Yaml { source, .. } => Some(source),
            Error::Json { source, .. } => Some(source),
            Error::Destination(error) => Some(error),
            Error::Invalid(_) => None,
        }
    }
}

impl From<InvalidDestination> for Error {
    fn from(value: InvalidDestination) -> Self {
        Error::Destination(value)
    }
}
