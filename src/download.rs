use crate::{
    config::ConfigStore,
    database::Database,
    layout::{plan_layout, staging_path, DownloadLayout},
    model::{Model, ModelFile, ModelImage, ModelVersion},
    preview::fetch_preview_bytes,
    sidecar::write_sidecars,
};
use anyhow::{anyhow, Context, Result};
use futures::{StreamExt, TryStreamExt};
use log::{debug, info, warn};
use reqwest::{header, Client, StatusCode};
use sha2::{Digest, Sha256};
use std::{
    path::{Path, PathBuf},
    sync::{mpsc::Sender, Arc},
    time::Instant,
};
use thiserror::Error;
use tokio::{
    fs,
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufWriter},
    runtime::Runtime,
};
use tokio_util::{io::StreamReader, sync::CancellationToken};

const IMAGE_CONCURRENCY: usize = 4;
const IO_BUFFER_INITIAL: usize = 128 * 1024;
const IO_BUFFER_MIN: usize = 64 * 1024;
const IO_BUFFER_MAX: usize = 1024 * 1024;
const ADAPTIVE_STEP_BYTES: u64 = 5 * 1024 * 1024;
const ADAPTIVE_GROW_MBPS: f64 = 50.0;
const ADAPTIVE_SHRINK_MBPS: f64 = 5.0;
const SNIFF_BYTES: usize = 2048;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadTarget {
    Model(i64),
    Version(i64),
    File(i64),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    #[default]
    Skip,
    Overwrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloaded,
    SkippedExisting,
}

#[derive(Clone, Debug)]
pub struct ResolvedDownload {
    pub model: Model,
    pub version: ModelVersion,
    pub file: ModelFile,
    pub images: Vec<ModelImage>,
    pub layout: DownloadLayout,
}

#[derive(Clone, Debug)]
pub struct DownloadOutcome {
    pub file: ModelFile,
    pub destination: PathBuf,
    pub status: DownloadStatus,
    pub previews_saved: usize,
}

#[derive(Clone, Debug)]
pub enum DownloadSignal {
    Started {
        artifact: String,
        size: Option<u64>,
    },
    Progress {
        artifact: String,
        received: u64,
        size: Option<u64>,
    },
    PreviewSaved {
        path: PathBuf,
    },
    Finished {
        artifact: String,
        size: Option<u64>,
        folder: Option<String>,
    },
    Failed {
        artifact: String,
        error: String,
    },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("model {0} is not in the local catalog")]
    UnknownModel(i64),
    #[error("model version {0} is not in the local catalog")]
    UnknownVersion(i64),
    #[error("model file {0} is not in the local catalog")]
    UnknownFile(i64),
    #[error("model {0} has no versions")]
    NoVersions(i64),
    #[error("model version {0} has no safe file to download")]
    NoSafeFile(i64),
    #[error("unauthorized")]
    Unauthorized,
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("download cancelled by user")]
    Cancelled,
}

#[derive(Debug)]
pub struct DownloadManager {
    runtime: Arc<Runtime>,
    config: Arc<ConfigStore>,
    database: Arc<Database>,
    api_client: Client,
    download_client: Client,
}

impl DownloadManager {
    pub fn new(
        runtime: Arc<Runtime>,
        config: Arc<ConfigStore>,
        database: Arc<Database>,
    ) -> Result<Self> {
        Ok(Self {
            runtime,
            config,
            database,
            api_client: make_http_client()?,
            download_client: make_download_client()?,
        })
    }

    pub fn resolve(&self, target: DownloadTarget) -> Result<ResolvedDownload> {
        let (model, version, file) = resolve_target(&self.database, target)?;
        let images = self.database.images_for_version(version.id)?;
        let layout = plan_layout(
            &self.config.settings(),
            &self.config.library_root(),
            &model,
            &version,
            &file,
        );
        debug!("Resolved {target:?} to {:?}", layout.file_path);
        Ok(ResolvedDownload {
            model,
            version,
            file,
            images,
            layout,
        })
    }

    pub fn download(
        &self,
        target: DownloadTarget,
        policy: OverwritePolicy,
        progress: Sender<DownloadSignal>,
    ) -> tokio::task::JoinHandle<Result<DownloadOutcome>> {
        self.download_with_cancel(target, policy, progress, None)
    }

    pub fn download_with_cancel(
        &self,
        target: DownloadTarget,
        policy: OverwritePolicy,
        progress: Sender<DownloadSignal>,
        cancel: Option<CancellationToken>,
    ) -> tokio::task::JoinHandle<Result<DownloadOutcome>> {
        let resolved = self.resolve(target);
        let api_client = self.api_client.clone();
        let download_client = self.download_client.clone();
        let token = self.config.api_token();
        let previews = self.config.download_previews();

        self.runtime.spawn(async move {
            let resolved = match resolved {
                Ok(resolved) => resolved,
                Err(err) => {
                    let _ = progress.send(DownloadSignal::Failed {
                        artifact: format!("{target:?}"),
                        error: format!("{err:#}"),
                    });
                    return Err(err);
                }
            };
            let artifact = resolved.file.name.clone();
            let result = run_download(
                &api_client,
                &download_client,
                &resolved,
                policy,
                token.as_deref(),
                previews,
                &progress,
                cancel.as_ref(),
            )
            .await;

            match result {
                Ok(outcome) => {
                    info!(
                        "{} -> {:?} ({:?})",
                        artifact, outcome.destination, outcome.status
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    let message = if matches!(
                        err.downcast_ref::<DownloadError>(),
                        Some(DownloadError::Unauthorized)
                    ) {
                        if token.is_some() {
                            "The catalog rejected the token (401/403). Check that your API token is valid and active.".to_string()
                        } else {
                            "This model appears to require login. Set CIVITAI_API_KEY or store a token and retry.".to_string()
                        }
                    } else {
                        format!("{err:#}")
                    };
                    let _ = progress.send(DownloadSignal::Failed {
                        artifact,
                        error: message,
                    });
                    Err(err)
                }
            }
        })
    }
}

fn resolve_target(
    database: &Database,
    target: DownloadTarget,
) -> Result<(Model, ModelVersion, ModelFile)> {
    match target {
        DownloadTarget::Model(model_id) => {
            let model = database
                .model(model_id)?
                .ok_or(DownloadError::UnknownModel(model_id))?;
            let version = database
                .latest_version(model_id)?
                .ok_or(DownloadError::NoVersions(model_id))?;
            let file = database
                .primary_safe_file(version.id)?
                .ok_or(DownloadError::NoSafeFile(version.id))?;
            Ok((model, version, file))
        }
        DownloadTarget::Version(version_id) => {
            let version = database
                .version(version_id)?
                .ok_or(DownloadError::UnknownVersion(version_id))?;
            let model = database
                .model(version.model_id)?
                .ok_or(DownloadError::UnknownModel(version.model_id))?;
            let file = database
                .primary_safe_file(version.id)?
                .ok_or(DownloadError::NoSafeFile(version.id))?;
            Ok((model, version, file))
        }
        DownloadTarget::File(file_id) => {
            let file = database
                .file(file_id)?
                .ok_or(DownloadError::UnknownFile(file_id))?;
            let version = database
                .version(file.model_version_id)?
                .ok_or(DownloadError::UnknownVersion(file.model_version_id))?;
            let model = database
                .model(file.model_id)?
                .ok_or(DownloadError::UnknownModel(file.model_id))?;
            Ok((model, version, file))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_download(
    api_client: &Client,
    download_client: &Client,
    resolved: &ResolvedDownload,
    policy: OverwritePolicy,
    token: Option<&str>,
    previews: bool,
    progress: &Sender<DownloadSignal>,
    cancel: Option<&CancellationToken>,
) -> Result<DownloadOutcome> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(DownloadError::Cancelled.into());
    }

    let layout = &resolved.layout;
    let artifact = resolved.file.name.clone();
    let folder = Some(layout.dir().to_string_lossy().to_string());

    if fs::try_exists(&layout.file_path)
        .await
        .with_context(|| format!("failed to check {:?} existence", layout.file_path))?
    {
        match policy {
            OverwritePolicy::Skip => {
                info!("{:?} already exists, skipping", layout.file_path);
                let _ = progress.send(DownloadSignal::Finished {
                    artifact,
                    size: Some(0),
                    folder,
                });
                return Ok(DownloadOutcome {
                    file: resolved.file.clone(),
                    destination: layout.file_path.clone(),
                    status: DownloadStatus::SkippedExisting,
                    previews_saved: 0,
                });
            }
            OverwritePolicy::Overwrite => {
                fs::remove_file(&layout.file_path)
                    .await
                    .with_context(|| format!("failed to remove {:?}", layout.file_path))?;
            }
        }
    }

    fs::create_dir_all(layout.dir())
        .await
        .with_context(|| format!("failed to create directory {:?}", layout.dir()))?;

    let previews_saved = if previews {
        save_previews(api_client, layout, &resolved.images, token, progress).await
    } else {
        0
    };

    write_sidecars(
        layout,
        &resolved.model,
        &resolved.version,
        resolved.images.first(),
    )
    .await?;

    let size = resolved.file.size_bytes();
    let _ = progress.send(DownloadSignal::Started {
        artifact: artifact.clone(),
        size,
    });

    let url = with_token(&resolved.file.url, token);
    let expected = Some(resolved.file.sha256.as_str()).filter(|digest| !digest.is_empty());
    let received = stream_to_file(
        download_client,
        &url,
        &layout.file_path,
        token,
        expected,
        Some((progress, artifact.as_str())),
        cancel,
    )
    .await?;

    let _ = progress.send(DownloadSignal::Finished {
        artifact,
        size: Some(received),
        folder,
    });

    Ok(DownloadOutcome {
        file: resolved.file.clone(),
        destination: layout.file_path.clone(),
        status: DownloadStatus::Downloaded,
        previews_saved,
    })
}

async fn save_previews(
    client: &Client,
    layout: &DownloadLayout,
    images: &[ModelImage],
    token: Option<&str>,
    progress: &Sender<DownloadSignal>,
) -> usize {
    let jobs: Vec<(PathBuf, String)> = images
        .iter()
        .enumerate()
        .map(|(index, image)| (layout.image_path(index), image.url.clone()))
        .collect();
    let token = token.map(str::to_string);

    let results: Vec<Option<PathBuf>> = futures::stream::iter(jobs)
        .map(|(path, url)| {
            let client = client.clone();
            let token = token.clone();
            async move {
                if url.is_empty() {
                    return None;
                }
                match save_preview(&client, &url, &path, token.as_deref()).await {
                    Ok(()) => Some(path),
                    Err(err) => {
                        warn!("Skipping preview {url}: {err:#}");
                        None
                    }
                }
            }
        })
        .buffer_unordered(IMAGE_CONCURRENCY)
        .collect()
        .await;

    let mut saved = 0;
    for path in results.into_iter().flatten() {
        saved += 1;
        let _ = progress.send(DownloadSignal::PreviewSaved { path });
    }
    saved
}

async fn save_preview(client: &Client, url: &str, path: &Path, token: Option<&str>) -> Result<()> {
    let bytes = fetch_preview_bytes(client, url, token).await?;
    let part = staging_path(path);
    if let Err(err) = fs::write(&part, bytes).await {
        fs::remove_file(&part).await.ok();
        return Err(err).with_context(|| format!("failed to write preview {part:?}"));
    }
    promote_part(&part, path).await
}

#[derive(Debug)]
struct StagedPart {
    path: PathBuf,
    received: u64,
    sha256: String,
    head: Vec<u8>,
}

/// Adaptive read buffer: grows on fast links, shrinks on slow ones.
struct ReadBuffer {
    bytes: Vec<u8>,
    since_adjust: u64,
    last_adjust: Instant,
}

impl ReadBuffer {
    fn new() -> Self {
        Self {
            bytes: vec![0u8; IO_BUFFER_INITIAL],
            since_adjust: 0,
            last_adjust: Instant::now(),
        }
    }

    fn record(&mut self, n: usize) {
        self.since_adjust += n as u64;
        if self.since_adjust < ADAPTIVE_STEP_BYTES {
            return;
        }

        let elapsed = self.last_adjust.elapsed().as_secs_f64().max(0.001);
        let mbps = self.since_adjust as f64 / 1024.0 / 1024.0 / elapsed;
        let len = self.bytes.len();
        if mbps > ADAPTIVE_GROW_MBPS && len < IO_BUFFER_MAX {
            self.bytes.resize((len * 2).min(IO_BUFFER_MAX), 0);
        } else if mbps < ADAPTIVE_SHRINK_MBPS && len > IO_BUFFER_MIN {
            self.bytes.resize((len / 2).max(IO_BUFFER_MIN), 0);
        }

        self.since_adjust = 0;
        self.last_adjust = Instant::now();
    }
}

async fn stream_to_file(
    client: &Client,
    url: &str,
    dest_path: &Path,
    auth_token: Option<&str>,
    expected_sha256: Option<&str>,
    progress: Option<(&Sender<DownloadSignal>, &str)>,
    cancel: Option<&CancellationToken>,
) -> Result<u64> {
    let file_name = dest_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());

    let mut request = client.get(url);
    if let Some(token) = auth_token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = request
        .send()
        .await
        .map_err(reqwest::Error::without_url)
        .with_context(|| format!("request failed for {}", redact_token(url)))?;

    let status = response.status();
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        return Err(DownloadError::Unauthorized.into());
    }
    if status.is_client_error() || status.is_server_error() {
        return Err(anyhow!(
            "download failed for {} (status {status})",
            redact_token(url)
        ));
    }

    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase());
    let content_length = response.content_length();

    let stream = response.bytes_stream().map_err(|err| {
        std::io::Error::new(std::io::ErrorKind::Other, err.without_url())
    });
    let mut reader = StreamReader::new(stream);

    let staged = stage_stream(&mut reader, dest_path, content_length, progress, cancel)
        .await
        .with_context(|| format!("failed streaming {}", redact_token(url)))?;

    if looks_like_non_binary_payload(
        content_type.as_deref(),
        &staged.head,
        staged.received,
        &file_name,
    ) {
        fs::remove_file(&staged.path).await.ok();
        if auth_token.is_some() {
            return Err(anyhow!(
                "Server returned a non-file response. The token may be invalid/expired, or this model requires additional access."
            ));
        }
        return Err(anyhow!(
            "Server returned an access/challenge page instead of model weights; an API token is likely required."
        ));
    }

    if let Some(expected) = expected_sha256 {
        if !staged.sha256.eq_ignore_ascii_case(expected) {
            fs::remove_file(&staged.path).await.ok();
            return Err(DownloadError::ChecksumMismatch {
                expected: expected.to_ascii_lowercase(),
                actual: staged.sha256,
            }
            .into());
        }
    }

    promote_part(&staged.path, dest_path).await?;
    Ok(staged.received)
}

/// Stages `reader` next to `dest_path`. Nothing is left behind when staging fails.
async fn stage_stream<R>(
    reader: &mut R,
    dest_path: &Path,
    content_length: Option<u64>,
    progress: Option<(&Sender<DownloadSignal>, &str)>,
    cancel: Option<&CancellationToken>,
) -> Result<StagedPart>
where
    R: AsyncRead + Unpin,
{
    let part = staging_path(dest_path);
    match write_part(reader, &part, content_length, progress, cancel).await {
        Ok(staged) => Ok(staged),
        Err(err) => {
            fs::remove_file(&part).await.ok();
            Err(err)
        }
    }
}

async fn write_part<R>(
    reader: &mut R,
    part: &Path,
    content_length: Option<u64>,
    progress: Option<(&Sender<DownloadSignal>, &str)>,
    cancel: Option<&CancellationToken>,
) -> Result<StagedPart>
where
    R: AsyncRead + Unpin,
{
    let file = fs::File::create(part)
        .await
        .with_context(|| format!("failed to create temporary file {part:?}"))?;
    let mut file = BufWriter::new(file);
    let mut buffer = ReadBuffer::new();
    let mut hasher = Sha256::new();
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    let mut received: u64 = 0;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(DownloadError::Cancelled.into());
        }
        let n = reader.read(&mut buffer.bytes).await?;
        if n == 0 {
            break;
        }
        let chunk = &buffer.bytes[..n];
        file.write_all(chunk)
            .await
            .with_context(|| format!("failed writing to {part:?}"))?;
        hasher.update(chunk);
        if head.len() < SNIFF_BYTES {
            let take = (SNIFF_BYTES - head.len()).min(n);
            head.extend_from_slice(&chunk[..take]);
        }
        received += n as u64;
        buffer.record(n);
        if let Some((sender, artifact)) = progress {
            let _ = sender.send(DownloadSignal::Progress {
                artifact: artifact.to_string(),
                received,
                size: content_length,
            });
        }
    }

    file.flush()
        .await
        .with_context(|| format!("failed flushing {part:?}"))?;

    Ok(StagedPart {
        path: part.to_path_buf(),
        received,
        sha256: to_hex(&hasher.finalize()),
        head,
    })
}

fn make_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(format!(
            "CivitaiBrowser/{} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_NAME")
        ))
        .tcp_nodelay(true)
        .pool_max_idle_per_host(4)
        .build()
        .context("failed to construct reqwest client")
}

fn make_download_client() -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        header::HeaderValue::from_static("application/octet-stream,*/*;q=0.8"),
    );

    Client::builder()
        .user_agent(format!(
            "CivitaiBrowser/{} ({})",
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_NAME")
        ))
        .default_headers(headers)
        .tcp_keepalive(std::time::Duration::from_secs(15))
        .build()
        .context("failed to construct download HTTP client")
}

fn with_token(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if !url.contains("token=") => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}token={token}")
        }
        _ => url.to_string(),
    }
}

fn redact_token(url: &str) -> String {
    match url.find("token=") {
        Some(pos) => {
            let rest = &url[pos + "token=".len()..];
            let tail = rest.find('&').map(|end| &rest[end..]).unwrap_or("");
            format!("{}token=***{}", &url[..pos], tail)
        }
        None => url.to_string(),
    }
}

fn looks_like_non_binary_payload(
    content_type: Option<&str>,
    first_bytes: &[u8],
    total_bytes: u64,
    file_name: &str,
) -> bool {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase());
    let expects_binary = matches!(
        ext.as_deref(),
        Some("safetensors" | "ckpt" | "pt" | "pth" | "bin" | "zip" | "gguf")
    );
    if !expects_binary {
        return false;
    }

    if let Some(ct) = content_type {
        if ct.contains("text/html")
            || ct.contains("application/json")
            || ct.contains("text/plain")
            || ct.contains("application/xml")
        {
            return true;
        }
    }

    if total_bytes > 512 * 1024 {
        return false;
    }

    let prefix = String::from_utf8_lossy(first_bytes).to_ascii_lowercase();
    let trimmed = prefix.trim_start();
    trimmed.starts_with("<!doctype html")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<?xml")
        || trimmed.starts_with("{\"error\"")
        || trimmed.starts_with("{\"detail\"")
        || trimmed.contains("access denied")
}

/// Renames a finished `.part` file into place, copying across filesystems when needed.
async fn promote_part(part: &Path, dest: &Path) -> Result<()> {
    if let Err(rename_err) = fs::rename(part, dest).await {
        debug!("rename {part:?} -> {dest:?} failed ({rename_err}), copying instead");
        let copied = fs::copy(part, dest)
            .await
            .with_context(|| format!("failed to move {part:?} into {dest:?}"));
        fs::remove_file(part).await.ok();
        copied?;
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::ApiModel,
        model::{deserialise_items, Page},
    };
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;
    use std::{io::Cursor, sync::mpsc};
    use tempfile::TempDir;
    use tokio::runtime::Builder;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const WEIGHTS: &[u8] = b"\x08\x00\x00\x00\x00\x00\x00\x00{}fake-tensor-bytes";

    struct Fixture {
        runtime: Arc<Runtime>,
        server: MockServer,
        manager: DownloadManager,
        library: PathBuf,
        _temp: TempDir,
    }

    fn png_bytes() -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn catalog_page(base: &str, sha256: &str) -> Page {
        let data: ApiModel = serde_json::from_value(json!({
            "id": 1,
            "name": "Paper Cut",
            "type": "LORA",
            "tags": ["style"],
            "description": "Model notes",
            "stats": {},
            "modelVersions": [
                {
                    "id": 10, "name": "v1", "trainedWords": [], "baseModel": "SD 1.5",
                    "files": [], "images": []
                },
                {
                    "id": 11, "name": "v2", "trainedWords": ["paper"], "baseModel": "SD 1.5",
                    "files": [{
                        "id": 100, "name": "paper_cut.safetensors",
                        "downloadUrl": format!("{base}/files/100"), "sizeKB": 0.03,
                        "primary": true, "pickleScanResult": "Success", "virusScanResult": "Success",
                        "hashes": {"SHA256": sha256}
                    }],
                    "images": [
                        {"id": 5, "url": format!("{base}/img/5.png"), "width": 2, "height": 2},
                        {"id": 6, "url": format!("{base}/img/6.png"), "width": 2, "height": 2}
                    ]
                }
            ]
        }))
        .unwrap();
        deserialise_items(&[data], 1_700_000_000).unwrap()
    }

    fn fixture(sha256: &str) -> Fixture {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap(),
        );
        let server = runtime.block_on(MockServer::start());
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");

        let config = Arc::new(
            ConfigStore::with_root(temp.path().join("app"), temp.path().to_path_buf()).unwrap(),
        );
        config
            .update_settings(|settings| {
                settings.library_root = Some(library.clone());
                settings
                    .type_dirs
                    .insert("LORA".into(), PathBuf::from("loras"));
            })
            .unwrap();

        let database = Arc::new(Database::open_in_memory().unwrap());
        database
            .insert_page(&catalog_page(&server.uri(), sha256))
            .unwrap();

        let manager = DownloadManager::new(runtime.clone(), config, database).unwrap();
        Fixture {
            runtime,
            server,
            manager,
            library,
            _temp: temp,
        }
    }

    fn mount_assets(fx: &Fixture, file_response: ResponseTemplate) {
        fx.runtime.block_on(async {
            Mock::given(method("GET"))
                .and(path("/files/100"))
                .respond_with(file_response)
                .mount(&fx.server)
                .await;
            Mock::given(method("GET"))
                .and(path("/img/5.png"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
                .mount(&fx.server)
                .await;
            Mock::given(method("GET"))
                .and(path("/img/6.png"))
                .respond_with(ResponseTemplate::new(404))
                .mount(&fx.server)
                .await;
        });
    }

    fn weights_sha256() -> String {
        to_hex(&Sha256::digest(WEIGHTS))
    }

    fn expected_dir(fx: &Fixture) -> PathBuf {
        fx.library.join("loras/SD_1.5/style/Paper_Cut/v2")
    }

    #[test]
    fn model_target_downloads_latest_version_with_sidecars() {
        let fx = fixture(&weights_sha256());
        mount_assets(
            &fx,
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(WEIGHTS),
        );

        let (tx, rx) = mpsc::channel();
        let handle = fx
            .manager
            .download(DownloadTarget::Model(1), OverwritePolicy::Skip, tx);
        let outcome = fx.runtime.block_on(handle).unwrap().unwrap();

        let dir = expected_dir(&fx);
        assert_eq!(outcome.status, DownloadStatus::Downloaded);
        assert_eq!(outcome.destination, dir.join("paper_cut.safetensors"));
        assert_eq!(std::fs::read(&outcome.destination).unwrap(), WEIGHTS);
        assert_eq!(outcome.previews_saved, 1);

        // images are ordered newest first, so image 6 (missing) takes index 0
        assert!(!dir.join("paper_cut_0.jpg").exists());
        let preview = std::fs::read(dir.join("paper_cut_1.jpg")).unwrap();
        assert!(crate::preview::is_jpeg(&preview));

        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join("paper_cut.json")).unwrap()).unwrap();
        assert_eq!(meta["activation text"], "paper");
        assert_eq!(meta["image"]["id"], 6);
        assert!(dir.join("paper_cut.md").is_file());

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".part."))
            .collect();
        assert!(leftovers.is_empty());

        let signals: Vec<DownloadSignal> = rx.try_iter().collect();
        assert!(signals
            .iter()
            .any(|s| matches!(s, DownloadSignal::Finished { .. })));
    }

    #[test]
    fn existing_file_is_skipped_unless_overwriting() {
        let fx = fixture("");
        mount_assets(
            &fx,
            ResponseTemplate::new(200).set_body_bytes(WEIGHTS),
        );
        let dir = expected_dir(&fx);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("paper_cut.safetensors"), b"old").unwrap();

        let (tx, _rx) = mpsc::channel();
        let handle = fx
            .manager
            .download(DownloadTarget::Version(11), OverwritePolicy::Skip, tx.clone());
        let outcome = fx.runtime.block_on(handle).unwrap().unwrap();
        assert_eq!(outcome.status, DownloadStatus::SkippedExisting);
        assert_eq!(std::fs::read(dir.join("paper_cut.safetensors")).unwrap(), b"old");

        let handle = fx
            .manager
            .download(DownloadTarget::File(100), OverwritePolicy::Overwrite, tx);
        let outcome = fx.runtime.block_on(handle).unwrap().unwrap();
        assert_eq!(outcome.status, DownloadStatus::Downloaded);
        assert_eq!(std::fs::read(dir.join("paper_cut.safetensors")).unwrap(), WEIGHTS);
    }

    #[test]
    fn checksum_mismatch_leaves_nothing_behind() {
        let fx = fixture(&"0".repeat(64));
        mount_assets(&fx, ResponseTemplate::new(200).set_body_bytes(WEIGHTS));

        let (tx, _rx) = mpsc::channel();
        let handle = fx
            .manager
            .download(DownloadTarget::Model(1), OverwritePolicy::Skip, tx);
        let err = fx.runtime.block_on(handle).unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::ChecksumMismatch { .. })
        ));
        assert!(!expected_dir(&fx).join("paper_cut.safetensors").exists());
    }

    #[test]
    fn html_challenge_page_is_rejected() {
        let fx = fixture("");
        mount_assets(
            &fx,
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string("<!DOCTYPE html><html>login</html>"),
        );

        let (tx, rx) = mpsc::channel();
        let handle = fx
            .manager
            .download(DownloadTarget::Model(1), OverwritePolicy::Skip, tx);
        assert!(fx.runtime.block_on(handle).unwrap().is_err());
        assert!(!expected_dir(&fx).join("paper_cut.safetensors").exists());
        assert!(rx
            .try_iter()
            .any(|s| matches!(s, DownloadSignal::Failed { .. })));
    }

    #[test]
    fn forbidden_maps_to_unauthorized() {
        let fx = fixture("");
        mount_assets(&fx, ResponseTemplate::new(403));

        let (tx, _rx) = mpsc::channel();
        let handle = fx
            .manager
            .download(DownloadTarget::Model(1), OverwritePolicy::Skip, tx);
        let err = fx.runtime.block_on(handle).unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::Unauthorized)
        ));
    }

    #[test]
    fn unresolvable_targets_are_typed() {
        let fx = fixture("");
        let err = fx.manager.resolve(DownloadTarget::Model(42)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::UnknownModel(42))
        ));
        let err = fx.manager.resolve(DownloadTarget::Version(10)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::NoSafeFile(10))
        ));
        let err = fx.manager.resolve(DownloadTarget::File(7)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::UnknownFile(7))
        ));
    }

    #[test]
    fn cancelled_before_start() {
        let fx = fixture("");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel();
        let handle = fx.manager.download_with_cancel(
            DownloadTarget::Model(1),
            OverwritePolicy::Skip,
            tx,
            Some(cancel),
        );
        let err = fx.runtime.block_on(handle).unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::Cancelled)
        ));
    }

    #[test]
    fn token_is_appended_once_and_redacted() {
        assert_eq!(
            with_token("https://x/api/download/models/1", Some("k")),
            "https://x/api/download/models/1?token=k"
        );
        assert_eq!(
            with_token("https://x/a?type=Model", Some("k")),
            "https://x/a?type=Model&token=k"
        );
        assert_eq!(with_token("https://x/a?token=z", Some("k")), "https://x/a?token=z");
        assert_eq!(with_token("https://x/a", None), "https://x/a");
        assert_eq!(
            redact_token("https://x/a?token=secret&b=1"),
            "https://x/a?token=***&b=1"
        );
    }

    #[test]
    fn non_binary_detection_only_applies_to_weights() {
        assert!(looks_like_non_binary_payload(
            Some("application/json"),
            b"{}",
            2,
            "model.safetensors"
        ));
        assert!(!looks_like_non_binary_payload(
            Some("text/html"),
            b"<html>",
            6,
            "notes.txt"
        ));
        assert!(looks_like_non_binary_payload(
            None,
            b"  <!DOCTYPE html>",
            17,
            "model.ckpt"
        ));
    }

    #[test]
    fn unresolvable_target_reports_failure_signal() {
        let fx = fixture("");
        let (tx, rx) = mpsc::channel();
        let handle = fx
            .manager
            .download(DownloadTarget::Model(42), OverwritePolicy::Skip, tx);
        assert!(fx.runtime.block_on(handle).unwrap().is_err());

        let failed: Vec<String> = rx
            .try_iter()
            .filter_map(|signal| match signal {
                DownloadSignal::Failed { error, .. } => Some(error),
                _ => None,
            })
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].contains("model 42"));
    }

    #[tokio::test]
    async fn request_errors_do_not_leak_the_token() {
        let temp = TempDir::new().unwrap();
        let client = make_download_client().unwrap();
        let url = with_token("http://127.0.0.1:1/api/download/models/1", Some("SECRET123"));

        let err = stream_to_file(
            &client,
            &url,
            &temp.path().join("model.safetensors"),
            Some("SECRET123"),
            None,
            None,
            None,
        )
        .await
        .unwrap_err();

        let text = format!("{err:#} {err:?}");
        assert!(!text.contains("SECRET123"), "{text}");
        assert!(text.contains("token=***"));
    }

    #[tokio::test]
    async fn interrupted_stream_leaves_no_part_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("model.safetensors");
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
            Ok(b"partial tensor bytes"),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        ];
        let mut reader = StreamReader::new(futures::stream::iter(chunks));

        let result = stage_stream(&mut reader, &dest, None, None, None).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn staged_stream_hashes_and_keeps_head() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("model.safetensors");
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![Ok(WEIGHTS)];
        let mut reader = StreamReader::new(futures::stream::iter(chunks));

        let staged = stage_stream(&mut reader, &dest, None, None, None)
            .await
            .unwrap();
        assert_eq!(staged.received, WEIGHTS.len() as u64);
        assert_eq!(staged.sha256, weights_sha256());
        assert_eq!(staged.head, WEIGHTS);
        assert_eq!(std::fs::read(&staged.path).unwrap(), WEIGHTS);

        promote_part(&staged.path, &dest).await.unwrap();
        assert!(!staged.path.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), WEIGHTS);
    }

    #[tokio::test]
    async fn cancelled_stream_leaves_no_part_file() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("model.safetensors");
        let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![Ok(WEIGHTS)];
        let mut reader = StreamReader::new(futures::stream::iter(chunks));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = stage_stream(&mut reader, &dest, None, None, Some(&cancel))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::Cancelled)
        ));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
