use crate::output::{print_json, print_table};
use anyhow::{Context, Result};
use sessions_core::config::DaemonConfig;
use sessions_core::paths::FolderLayout;
use std::collections::BTreeMap;

pub fn run(config: &DaemonConfig, json: bool) -> Result<()> {
    let root = config.data_root()?;
    let layout = FolderLayout::resolve(root)
        .with_context(|| format!("invalid data folder {}", root.display()))?;

    if json {
        let mut folders: BTreeMap<&str, String> = layout
            .folders()
            .iter()
            .map(|(name, path)| (*name, path.display().to_string()))
            .collect();
        folders.insert("root", layout.root().display().to_string());
        return print_json(&folders);
    }

    let mut rows = vec![vec!["root".to_string(), layout.root().display().to_string()]];
    rows.extend(
        layout
            .folders()
            .iter()
            .map(|(name, path)| vec![name.to_string(), path.display().to_string()]),
    );
    print_table(&["FOLDER", "PATH"], rows);
    Ok(())
}
