use super::Format;
use crate::{
    config::Config,
    deps::{self, Layer},
    Result,
};

pub fn plan(config: &Config, format: Format) -> Result<()> {
    let layers = deps::linearize(&config.deps)?;
    match format {
        Format::Table => println!("{}", render_table(&layers)),
        Format::Json => println!("{}", serde_json::to_string_pretty(&layers)?),
    }
    Ok(())
}

fn render_table(layers: &[Layer]) -> comfy_table::Table {
    let mut table = super::table(["layer", "images"]);
    for (index, layer) in layers.iter().enumerate() {
        table.add_row([(index + 1).to_string(), layer.join("\n")]);
    }
    table
}
