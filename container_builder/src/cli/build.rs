use std::sync::Arc;

use clap::Args;
use constcat::concat;
use log::info;

use super::Format;
use crate::{
    builder::BuildahBuilder,
    config::{Config, DEFAULT_PRIVILEGE_PREFIX, DEFAULT_REGISTRY_ADDRESS, DEFAULT_TOOL},
    discover::ImagePaths,
    orchestrator::{BuildReport, Orchestrator},
    process::SystemExecutor,
    Result,
};

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Build the images without pushing them.
    #[arg(long = "no-push", default_value_t)]
    pub no_push: bool,

    /// Image to skip, may be repeated. Added to the excludes of the configuration.
    #[arg(long = "exclude", value_name = "IMAGE")]
    pub excludes: Vec<String>,

    /// Bind mount passed to every build, may be repeated. Added to the volumes of the configuration.
    #[arg(long = "volume")]
    pub volumes: Vec<String>,

    /// Run the build tool with debug logging.
    #[arg(long = "debug", default_value_t)]
    pub debug: bool,

    /// Seconds a single layer may take.
    #[arg(long = "build-timeout", value_parser = clap::value_parser!(u64).range(1..))]
    pub build_timeout: Option<u64>,

    #[arg(long = "tag")]
    pub tag: Option<String>,

    #[arg(long = "registry", help = concat!("Registry the images are pushed to, defaults to ", DEFAULT_REGISTRY_ADDRESS, "."))]
    pub registry: Option<String>,

    #[arg(long = "privilege-prefix", help = concat!("Command prepended to every ", DEFAULT_TOOL, " invocation, defaults to \"", DEFAULT_PRIVILEGE_PREFIX, "\". Pass an empty string to run ", DEFAULT_TOOL, " directly."))]
    pub privilege_prefix: Option<String>,

    #[arg(long = "format", value_enum, default_value_t)]
    pub format: Format,
}

impl BuildArgs {
    fn apply(self, config: &mut Config) {
        let BuildArgs {
            no_push,
            excludes,
            volumes,
            debug,
            build_timeout,
            tag,
            registry,
            privilege_prefix,
            format: _,
        } = self;

        if no_push {
            config.push_containers = false;
        }
        config.excludes.extend(excludes);
        config.volumes.extend(volumes);
        config.debug |= debug;
        if let Some(build_timeout) = build_timeout {
            config.build_timeout = build_timeout;
        }
        if let Some(tag) = tag {
            config.tag = tag;
        }
        if let Some(registry) = registry {
            config.registry_address = registry;
        }
        if let Some(privilege_prefix) = privilege_prefix {
            config.privilege_prefix = privilege_prefix;
        }
    }
}

pub fn build(mut config: Config, args: BuildArgs) -> Result<()> {
    let format = args.format;
    args.apply(&mut config);
    config.validate()?;

    let image_paths = ImagePaths::discover(&config.work_dir)
        .map_err(|error| format!("failed to search {}: {error}", config.work_dir.display()))?;
    info!("found {} image source directories in {}", image_paths.len(), config.work_dir.display());

    let builder = BuildahBuilder::new(&config, image_paths.clone(), Arc::new(SystemExecutor));
    let repository = config.repository();
    let timeout = config.build_timeout();
    let report = Orchestrator::new(config.deps, Arc::new(image_paths), Arc::new(builder), timeout).build_all(None)?;

    match format {
        Format::Table => print_table(&report, |name| repository.destination(name)),
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

fn print_table(report: &BuildReport, destination: impl Fn(&str) -> String) {
    let mut table = super::table(["layer", "image", "destination", "result"]);
    for (layer, image) in report.images() {
        table.add_row([
            (layer + 1).to_string(),
            image.name.clone(),
            destination(&image.name),
            image.generated.to_string(),
        ]);
    }
    println!("{table}");
}
