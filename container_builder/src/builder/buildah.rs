use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};

use super::{Builder, Generated};
use crate::{
    config::Config,
    destination::{InvalidDestination, Repository},
    discover::ImagePaths,
    process::{self, Execute, Invocation},
    retry::{RetriesExhausted, BUILD_RETRY, PUSH_RETRY},
};

/// Waits between retries. Swapped out in tests.
pub type Sleep = Arc<dyn Fn(Duration) + Send + Sync>;

/// Builds images with `buildah bud` and pushes them with `buildah push`.
pub struct BuildahBuilder {
    base_argv: Vec<String>,
    repository: Repository,
    image_paths: ImagePaths,
    excludes: BTreeSet<String>,
    volumes: Vec<String>,
    push_containers: bool,
    executor: Arc<dyn Execute>,
    sleep: Sleep,
}

impl BuildahBuilder {
    pub fn new(config: &Config, image_paths: ImagePaths, executor: Arc<dyn Execute>) -> Self {
        let base_argv = config
            .privilege_prefix
            .split_whitespace()
            .chain([config.tool.as_str()])
            .chain(config.debug.then_some("--log-level=debug"))
            .map(str::to_owned)
            .collect();

        Self {
            base_argv,
            repository: config.repository(),
            image_paths,
            excludes: config.excludes.clone(),
            volumes: config.volumes.clone(),
            push_containers: config.push_containers,
            executor,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    pub fn with_sleep(mut self, sleep: Sleep) -> Self {
        self.sleep = sleep;
        self
    }

    fn base(&self) -> Invocation {
        Invocation::new(self.base_argv.iter().cloned())
    }

    pub fn destination(&self, name: &str) -> Result<String, InvalidDestination> {
        self.repository.checked_destination(name)
    }

    pub fn log_file(name: &str, source_dir: &Path) -> PathBuf {
        source_dir.join(format!("{name}-build.log"))
    }

    pub fn build_invocation(&self, name: &str, source_dir: &Path) -> Result<Invocation, Error> {
        let destination = self.destination(name)?;
        let log_file = Self::log_file(name, source_dir);

        Ok(self
            .base()
            .arg("bud")
            .args(
                self.volumes
                    .iter()
                    .flat_map(|volume| ["--volume", volume.as_str()]),
            )
            .args(["--format", "docker", "--tls-verify=False", "--logfile"])
            .arg(log_file.display().to_string())
            .args(["-t", destination.as_str()])
            .arg(source_dir.display().to_string())
            .standard_locale()
            .checked())
    }

    pub fn push_invocation(&self, destination: &str) -> Invocation {
        self.base()
            .args(["push", "--tls-verify=False", destination])
            .arg(format!("docker://{destination}"))
            .checked()
    }

    /// Builds the image from `source_dir`, retrying failed builds.
    pub fn build(&self, name: &str, source_dir: &Path) -> Result<(), Error> {
        let invocation = self.build_invocation(name, source_dir)?;

        // Without a source directory the build is left to fail in the build tool, with no log left behind.
        if !source_dir.as_os_str().is_empty() {
            let log_file = Self::log_file(name, source_dir);
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .map_err(|source| Error::LogFile {
                    path: log_file.clone(),
                    source,
                })?;
        }

        info!("building {name}: {}", invocation.display());

        BUILD_RETRY
            .run(&*self.sleep, |attempt| {
                debug!("build of {name}, attempt {attempt}");
                self.executor.execute(&invocation)
            })
            .map_err(|source| Error::BuildRetriesExhausted {
                name: name.to_owned(),
                source,
            })?;

        Ok(())
    }

    /// Pushes a previously built image, retrying failed pushes.
    pub fn push(&self, destination: &str) -> Result<(), Error> {
        let invocation = self.push_invocation(destination);
        info!("pushing {destination}: {}", invocation.display());

        PUSH_RETRY
            .run(&*self.sleep, |attempt| {
                debug!("push of {destination}, attempt {attempt}");
                self.executor.execute(&invocation)
            })
            .map_err(|source| Error::PushRetriesExhausted {
                destination: destination.to_owned(),
                source,
            })?;

        Ok(())
    }

    pub fn generate_one(&self, name: &str) -> Result<Generated, Error> {
        if self.excludes.contains(name) {
            info!("skipping excluded image {name}");
            return Ok(Generated::Excluded);
        }

        self.build(name, self.image_paths.resolve(name))?;

        if !self.push_containers {
            return Ok(Generated::Built);
        }

        self.push(&self.destination(name)?)?;
        Ok(Generated::BuiltAndPushed)
    }
}

impl Builder for BuildahBuilder {
    fn generate(&self, name: &str) -> crate::Result<Generated> {
        Ok(self.generate_one(name)?)
    }
}

#[derive(Debug)]
pub enum Error {
    Destination(InvalidDestination),
    LogFile {
        path: PathBuf,
        source: io::Error,
    },
    BuildRetriesExhausted {
        name: String,
        source: RetriesExhausted<process::Error>,
    },
    PushRetriesExhausted {
        destination: String,
        source: RetriesExhausted<process::Error>,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Destination(error) => write!(f, "{error}"),
            Error::LogFile { path, source } => {
                write!(f, "failed to create build log {}: {source}", path.display())
            }
            Error::BuildRetriesExhausted { name, source } => {
                write!(f, "failed to build image {name:?}, {source}")
            }
            Error::PushRetriesExhausted {
                destination,
                source,
            } => write!(f, "failed to push {destination}, {source}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Destination(error) => Some(error),
            Error::LogFile { source, .. } => Some(source),
            Error::BuildRetriesExhausted { source, .. } => Some(source),
            Error::PushRetriesExhausted { source, .. } => Some(source),
        }
    }
}

impl From<InvalidDestination> for Error {
    fn from(value: InvalidDestination) -> Self {
        Error::Destination(value)
    }
}
