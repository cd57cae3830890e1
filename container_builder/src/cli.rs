mod build;
mod discover;
mod plan;

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use comfy_table::{Attribute, Cell, ContentArrangement, Table};
use log::debug;

use crate::{config::Config, Result};

#[derive(Debug, Default, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum Format {
    /// Human readable table.
    #[default]
    Table,
    Json,
}

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    source: SourceArgs,
}

/// Where the configuration and the dependency description come from.
#[derive(Debug, Args)]
pub struct SourceArgs {
    /// YAML configuration file. Without it every setting has its default value.
    #[arg(long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// YAML or JSON file with the image dependencies, replacing the ones in the configuration.
    #[arg(long = "deps", global = true)]
    pub deps: Option<PathBuf>,

    /// Directory searched for image sources, replacing the one in the configuration.
    #[arg(long = "work-dir", global = true)]
    pub work_dir: Option<PathBuf>,
}

impl SourceArgs {
    pub fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                debug!("loading configuration from {}", path.display());
                Config::load(path)?
            }
            None => Config::default(),
        };
        if let Some(path) = &self.deps {
            config.deps = crate::config::load_deps(path)?;
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir.clone_from(work_dir);
        }
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build, and optionally push, every image layer by layer
    Build(build::BuildArgs),

    /// Print the layers images would be built in
    Plan {
        #[arg(long = "format", value_enum, default_value_t)]
        format: Format,
    },

    /// List the image source directories found in the work directory
    Discover {
        #[arg(long = "format", value_enum, default_value_t)]
        format: Format,
    },
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let config = self.source.load()?;

        match self.command {
            Commands::Build(args) => {
                build::build(config, args)?;
            }
            Commands::Plan { format } => {
                plan::plan(&config, format)?;
            }
            Commands::Discover { format } => {
                discover::discover(&config.work_dir, format)?;
            }
        }

        Ok(())
    }
}

fn table<I, S>(header: I) -> Table
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .into_iter()
                .map(|name| Cell::new(name.into()).add_attribute(Attribute::Bold)),
        );
    table
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}
