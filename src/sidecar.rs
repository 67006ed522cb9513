use crate::{
    layout::DownloadLayout,
    model::{Model, ModelImage, ModelVersion},
};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use tokio::fs;

#[derive(Debug, Serialize)]
struct SidecarMetadata<'a> {
    name: &'a str,
    #[serde(rename = "activation text")]
    activation_text: String,
    description: String,
    model: &'a Model,
    version: &'a ModelVersion,
    image: Option<&'a ModelImage>,
}

pub fn metadata_json(
    model: &Model,
    version: &ModelVersion,
    image: Option<&ModelImage>,
) -> Result<Vec<u8>> {
    let metadata = SidecarMetadata {
        name: &model.name,
        activation_text: version.trained_words.join(","),
        description: format!("{}\n\n{}", version.description, model.description),
        model,
        version,
        image,
    };

    let mut out = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    metadata
        .serialize(&mut serializer)
        .context("failed to serialise sidecar metadata")?;
    Ok(out)
}

pub fn info_markdown(model: &Model, version: &ModelVersion) -> String {
    format!(
        "# {}: {}\n\n## Model Description\n{}\n\n## Version Description\n{}",
        model.name, version.name, model.description, version.description
    )
}

pub async fn write_sidecars(
    layout: &DownloadLayout,
    model: &Model,
    version: &ModelVersion,
    image: Option<&ModelImage>,
) -> Result<()> {
    fs::create_dir_all(layout.dir())
        .await
        .with_context(|| format!("failed to create directory {:?}", layout.dir()))?;

    let json = metadata_json(model, version, image)?;
    fs::write(&layout.json_path, json)
        .await
        .with_context(|| format!("failed to write {:?}", layout.json_path))?;

    fs::write(&layout.markdown_path, info_markdown(model, version))
        .await
        .with_context(|| format!("failed to write {:?}", layout.markdown_path))?;

    Ok(())
}
