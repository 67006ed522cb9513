use anyhow::{Context, Result};
use std::path::Path;

pub fn reveal(path: &Path) -> Result<()> {
    let dir = if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or(path)
    };
    open::that(dir).with_context(|| format!("failed to open {dir:?}"))?;
    Ok(())
}
