use std::{fmt, sync::Arc, time::Duration};

use log::{info, warn};
use serde::Serialize;

use crate::{
    builder::Builder,
    deps::{self, CyclicDependency, Deps, Layer},
    discover::ImagePaths,
    layer::{ImageReport, LayerError, LayerExecutor},
};

/// Outcome of one layer, in the order its images were listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerReport {
    pub images: Vec<ImageReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub layers: Vec<LayerReport>,
}

impl BuildReport {
    pub fn images(&self) -> impl Iterator<Item = (usize, &ImageReport)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(index, layer)| layer.images.iter().map(move |image| (index, image)))
    }
}

pub struct Orchestrator {
    deps: Deps,
    image_paths: Arc<ImagePaths>,
    builder: Arc<dyn Builder>,
    timeout: Duration,
    cores: Option<usize>,
}

impl Orchestrator {
    pub fn new(deps: Deps, image_paths: Arc<ImagePaths>, builder: Arc<dyn Builder>, timeout: Duration) -> Self {
        Self {
            deps,
            image_paths,
            builder,
            timeout,
            cores: None,
        }
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Layers for `deps`, or for the configured dependencies when `None`.
    pub fn plan(&self, deps: Option<&Deps>) -> Result<Vec<Layer>, Error> {
        Ok(deps::linearize(deps.unwrap_or(&self.deps))?)
    }

    /// Builds every image layer by layer. Stops at the first layer that does not complete.
    pub fn build_all(&self, deps: Option<&Deps>) -> Result<BuildReport, Error> {
        let layers = self.plan(deps)?;

        for name in self
            .image_paths
            .missing(layers.iter().flatten().map(String::as_str))
        {
            warn!("no source directory found for image {name:?}");
        }

        let executor = LayerExecutor::new(Arc::clone(&self.builder), self.timeout);
        let executor = match self.cores {
            Some(cores) => executor.with_cores(cores),
            None => executor,
        };

        let mut report = BuildReport::default();
        for (index, layer) in layers.iter().enumerate() {
            info!("building layer {}/{}: {}", index + 1, layers.len(), layer.join(", "));
            let images = executor
                .run(layer)
                .map_err(|source| Error::Layer { index, source })?;
            report.layers.push(LayerReport { images });
        }
        Ok(report)
    }
}

#[derive(Debug)]
pub enum Error {
    Cycle(CyclicDependency),
    Layer { index: usize, source: LayerError },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cycle(error) => write!(f, "{error}"),
            Error::Layer { index, source } => write!(f, "layer {} failed, {source}", index + 1),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Cycle(error) => Some(error),
            Error::Layer { source, .. } => Some(source),
        }
    }
}

impl From<CyclicDependency> for Error {
    fn from(value: CyclicDependency) -> Self {
        Error::Cycle(value)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        builder::{BuildahBuilder, Generated},
        config::Config,
        testing::{recorded_sleep, FnBuilder, Recorder},
    };

    fn orchestrator(deps: Deps, builder: Arc<dyn Builder>) -> Orchestrator {
        Orchestrator::new(deps, Arc::new(ImagePaths::default()), builder, Duration::from_secs(30)).with_cores(4)
    }

    fn chain() -> Deps {
        serde_json::from_str(r#"{"a": {"b": "c"}}"#).unwrap()
    }

    #[test]
    fn test_chain_builds_dependencies_first() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        let report = orchestrator(chain(), builder.clone()).build_all(None).unwrap();

        assert_eq!(builder.started(), ["c", "b", "a"]);
        assert_eq!(
            report
                .images()
                .map(|(layer, image)| (layer, image.name.as_str()))
                .collect::<Vec<_>>(),
            [(0, "c"), (1, "b"), (2, "a")]
        );
    }

    #[test]
    fn test_explicit_deps_override_configured() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        let deps = Deps::from("x");
        orchestrator(chain(), builder.clone()).build_all(Some(&deps)).unwrap();
        assert_eq!(builder.started(), ["x"]);
    }

    #[test]
    fn test_empty_deps() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        let report = orchestrator(Deps::default(), builder.clone()).build_all(None).unwrap();
        assert!(report.layers.is_empty());
        assert!(builder.started().is_empty());
    }

    #[test]
    fn test_failure_stops_later_layers() {
        let builder = FnBuilder::new(|name| {
            if name == "b" {
                Err("b is broken".into())
            } else {
                Ok(Generated::Built)
            }
        });
        let error = orchestrator(chain(), builder.clone()).build_all(None).unwrap_err();

        assert_eq!(builder.started(), ["c", "b"]);
        let Error::Layer { index, source } = &error else {
            panic!("expected a layer error, got {error:?}");
        };
        assert_eq!(*index, 1);
        assert_eq!(source.images(), ["b"]);
        assert!(error.to_string().contains("b: b is broken"));
    }

    #[test]
    fn test_cycle() {
        let builder = FnBuilder::new(|_| Ok(Generated::Built));
        let deps: Deps = serde_json::from_str(r#"{"a": {"b": "a"}}"#).unwrap();
        let error = orchestrator(deps, builder.clone()).build_all(None).unwrap_err();
        assert!(matches!(error, Error::Cycle(_)));
        assert!(builder.started().is_empty());
    }

    #[test]
    fn test_build_retries_exhausted_fails_layer() {
        let dir = tempfile::tempdir().unwrap();
        let image_paths = [
            ("nova-base".to_owned(), dir.path().join("nova-base")),
            ("nova-api".to_owned(), dir.path().join("nova-api")),
        ]
        .into_iter()
        .collect::<ImagePaths>();
        for (_, path) in image_paths.iter() {
            std::fs::create_dir_all(path).unwrap();
        }

        let executor = Recorder::failing(|invocation| {
            invocation.argv.iter().any(|arg| arg == "bud")
                && invocation
                    .argv
                    .last()
                    .is_some_and(|dir| PathBuf::from(dir).ends_with("nova-api"))
        });
        let (sleep, sleeps) = recorded_sleep();
        let builder = BuildahBuilder::new(&Config::default(), image_paths.clone(), executor.clone()).with_sleep(sleep);
        let deps: Deps = serde_json::from_str(r#"{"nova-base": "nova-api"}"#).unwrap();

        let error = Orchestrator::new(deps, Arc::new(image_paths), Arc::new(builder), Duration::from_secs(30))
            .build_all(None)
            .unwrap_err();

        assert_eq!(executor.verbs(), ["bud", "bud", "bud"]);
        assert_eq!(sleeps.lock().unwrap().len(), 2);
        let message = error.to_string();
        assert!(message.contains("nova-api"));
        assert!(message.contains("gave up after 3 attempts"));
    }

    #[test]
    fn test_failing_image_does_not_stop_its_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let image_paths = ["x", "y", "z"]
            .into_iter()
            .map(|name| (name, dir.path().join(name)))
            .collect::<ImagePaths>();
        for (_, path) in image_paths.iter() {
            std::fs::create_dir_all(path).unwrap();
        }

        let executor = Recorder::failing(|invocation| {
            invocation.argv.iter().any(|arg| arg == "bud")
                && invocation
                    .argv
                    .last()
                    .is_some_and(|dir| PathBuf::from(dir).ends_with("y"))
        });
        let (sleep, _) = recorded_sleep();
        let builder = BuildahBuilder::new(&Config::default(), image_paths.clone(), executor.clone()).with_sleep(sleep);
        let deps: Deps = serde_json::from_str(r#"["x", "y", "z"]"#).unwrap();

        let error = Orchestrator::new(deps, Arc::new(image_paths), Arc::new(builder), Duration::from_secs(30))
            .with_cores(4)
            .build_all(None)
            .unwrap_err();

        let builds_of = |image: &str| {
            executor
                .invocations()
                .iter()
                .filter(|invocation| {
                    invocation.argv.iter().any(|arg| arg == "bud")
                        && invocation
                            .argv
                            .last()
                            .is_some_and(|dir| PathBuf::from(dir).ends_with(image))
                })
                .count()
        };
        assert_eq!(builds_of("y"), 3);
        assert!(builds_of("x") >= 1);
        assert!(builds_of("z") >= 1);

        let Error::Layer {
            source: LayerError::Failed { failures, .. },
            ..
        } = &error
        else {
            panic!("expected a failed layer, got {error:?}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "y");
        assert!(error.to_string().contains("gave up after 3 attempts"));
    }

    #[test]
    fn test_report_json() {
        let report = BuildReport {
            layers: vec![LayerReport {
                images: vec![ImageReport {
                    name: "a".to_owned(),
                    generated: Generated::BuiltAndPushed,
                }],
            }],
        };
        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"layers":[{"images":[{"name":"a","generated":"built-and-pushed"}]}]}"#
        );
    }
}
