use std::{collections::BTreeMap, path::Path};

use super::Format;
use crate::{discover::ImagePaths, Result};

pub fn discover(work_dir: &Path, format: Format) -> Result<()> {
    let image_paths = ImagePaths::discover(work_dir)
        .map_err(|error| format!("failed to search {}: {error}", work_dir.display()))?;

    match format {
        Format::Table => {
            let mut table = super::table(["image", "source directory"]);
            for (name, path) in image_paths.iter() {
                table.add_row([name.to_owned(), super::display_path(path)]);
            }
            println!("{table}");
        }
        Format::Json => {
            let map = image_paths.iter().collect::<BTreeMap<_, _>>();
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
    }
    Ok(())
}
