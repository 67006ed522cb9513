use anyhow::{anyhow, Result};
use civitai_browser::{
    api::{ListingQuery, SortOrder},
    app::AppContext,
    catalog::SyncSignal,
    database::{ModelFilter, ModelSort},
    download::{DownloadSignal, DownloadStatus, DownloadTarget, OverwritePolicy},
    model::Period,
    reveal::reveal,
};
use clap::{Parser, Subcommand, ValueEnum};
use env_logger::Env;
use log::{info, warn};
use std::{path::PathBuf, sync::mpsc, thread};

#[derive(Debug, Parser)]
#[command(name = "civitai-browser", version, about = "Browse and download catalog models")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch listing pages into the local catalog.
    Sync {
        #[arg(long, default_value = "AllTime")]
        period: Period,
        #[arg(long, default_value = "newest")]
        sort: String,
        #[arg(long = "type")]
        types: Vec<String>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        nsfw: Option<bool>,
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Search the local catalog.
    List {
        text: Option<String>,
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        base_model: Option<String>,
        #[arg(long)]
        nsfw: bool,
        #[arg(long, default_value = "updated")]
        sort: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Print known categories and table counts instead.
        #[arg(long)]
        stats: bool,
    },
    /// Show a model with its versions and files.
    Show { id: i64 },
    /// Download a model, version or file with previews and sidecars.
    Download {
        id: i64,
        #[arg(long, value_enum, default_value_t = TargetKind::Model)]
        target: TargetKind,
        #[arg(long)]
        overwrite: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        reveal: bool,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetKind {
    Model,
    Version,
    File,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    SetRoot { path: PathBuf },
    /// Map a model type (LORA, Checkpoint, ...) to a directory.
    SetPath { kind: String, dir: PathBuf },
    SetToken { token: String },
    SetEndpoint { url: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let context = AppContext::new()?;

    match cli.command {
        Command::Sync {
            period,
            sort,
            types,
            query,
            nsfw,
            max_pages,
        } => {
            let sort = SortOrder::from_label(&sort)
                .ok_or_else(|| anyhow!("unknown sort order '{sort}'"))?;
            let listing = ListingQuery {
                limit: context.config.settings().page_size,
                period,
                sort,
                types,
                query,
                nsfw,
                cursor: None,
            };
            let (tx, rx) = mpsc::channel();
            let printer = thread::spawn(move || {
                for signal in rx {
                    if let SyncSignal::Page { number, models, .. } = signal {
                        println!("page {number}: {models} models");
                    }
                }
            });
            let handle = context.catalog.sync(listing, max_pages, tx);
            let report = context.runtime.block_on(handle)??;
            let _ = printer.join();
            println!(
                "synced {} pages: {} models, {} versions, {} files, {} images",
                report.pages, report.models, report.versions, report.files, report.images
            );
        }
        Command::List {
            text,
            kind,
            category,
            base_model,
            nsfw,
            sort,
            limit,
            offset,
            stats,
        } => {
            if stats {
                let counts = context.database.counts()?;
                println!(
                    "{} models, {} versions, {} files, {} images",
                    counts.models, counts.versions, counts.files, counts.images
                );
                for category in context.database.categories()? {
                    println!("{category}");
                }
                return Ok(());
            }
            let filter = ModelFilter {
                text,
                kind,
                category,
                base_model,
                include_nsfw: nsfw || context.config.settings().show_nsfw,
                sort: ModelSort::from_label(&sort)
                    .ok_or_else(|| anyhow!("unknown sort '{sort}'"))?,
                limit,
                offset,
            };
            let result = context.database.search(&filter)?;
            for model in &result.models {
                println!(
                    "{:>8}  {:<12} {:<12} {}{}",
                    model.id,
                    model.kind,
                    model.category,
                    model.name,
                    if model.nsfw { " [nsfw]" } else { "" }
                );
            }
            println!(
                "{} of {} models",
                result.models.len(),
                result.total_count
            );
        }
        Command::Show { id } => {
            let model = context
                .database
                .model(id)?
                .ok_or_else(|| anyhow!("model {id} is not in the local catalog"))?;
            println!("{} ({}) by {}", model.name, model.kind, model.creator_name);
            println!("category: {}  downloads: {}", model.category, model.download_cnt);
            for version in context.database.versions_for_model(id)? {
                println!("  version {:>8}  {} [{}]", version.id, version.name, version.base_model);
                for file in context.database.files_for_version(version.id)? {
                    println!(
                        "    file {:>8}  {}  {:.1} MB{}",
                        file.id,
                        file.name,
                        file.size / 1024.0,
                        if file.is_primary { "  (primary)" } else { "" }
                    );
                }
            }
        }
        Command::Download {
            id,
            target,
            overwrite,
            dry_run,
            reveal: reveal_after,
        } => {
            let target = match target {
                TargetKind::Model => DownloadTarget::Model(id),
                TargetKind::Version => DownloadTarget::Version(id),
                TargetKind::File => DownloadTarget::File(id),
            };
            if dry_run {
                let resolved = context.downloads.resolve(target)?;
                println!("{}", resolved.layout.file_path.display());
                return Ok(());
            }

            let policy = if overwrite || context.config.settings().overwrite_existing {
                OverwritePolicy::Overwrite
            } else {
                OverwritePolicy::Skip
            };
            let (tx, rx) = mpsc::channel();
            let printer = thread::spawn(move || log_download_signals(rx));
            let handle = context.downloads.download(target, policy, tx);
            let outcome = context.runtime.block_on(handle)??;
            let _ = printer.join();

            match outcome.status {
                DownloadStatus::Downloaded => println!(
                    "saved {} ({} previews)",
                    outcome.destination.display(),
                    outcome.previews_saved
                ),
                DownloadStatus::SkippedExisting => println!(
                    "{} already exists, use --overwrite to replace it",
                    outcome.destination.display()
                ),
            }
            if reveal_after {
                if let Err(err) = reveal(&outcome.destination) {
                    warn!("Unable to open folder: {err:#}");
                }
            }
        }
        Command::Config(command) => run_config(&context, command)?,
    }

    Ok(())
}

fn run_config(context: &AppContext, command: ConfigCommand) -> Result<()> {
    let settings = match command {
        ConfigCommand::Show => context.config.settings(),
        ConfigCommand::SetRoot { path } => context
            .config
            .update_settings(|settings| settings.library_root = Some(path))?,
        ConfigCommand::SetPath { kind, dir } => context.config.update_settings(|settings| {
            settings.type_dirs.insert(kind, dir);
        })?,
        ConfigCommand::SetToken { token } => context.config.update_settings(|settings| {
            settings.civitai_token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        })?,
        ConfigCommand::SetEndpoint { url } => context
            .config
            .update_settings(|settings| settings.catalog_endpoint = Some(url))?,
    };

    let mut shown = settings;
    if shown.civitai_token.is_some() {
        shown.civitai_token = Some("***".to_string());
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    println!("library root: {}", context.config.library_root().display());
    println!("database: {}", context.config.database_path().display());
    Ok(())
}

fn log_download_signals(rx: mpsc::Receiver<DownloadSignal>) {
    let mut last_step = 0;
    for signal in rx {
        match signal {
            DownloadSignal::Started { artifact, size } => {
                last_step = 0;
                info!("Downloading {artifact} ({size:?} bytes)");
            }
            DownloadSignal::Progress {
                artifact,
                received,
                size: Some(size),
            } if size > 0 => {
                let step = received * 10 / size;
                if step > last_step {
                    last_step = step;
                    info!("{artifact}: {}%", step * 10);
                }
            }
            DownloadSignal::Progress { .. } => {}
            DownloadSignal::PreviewSaved { path } => info!("Saved preview {}", path.display()),
            DownloadSignal::Finished { artifact, folder, .. } => {
                info!("Finished {artifact} in {}", folder.unwrap_or_default())
            }
            DownloadSignal::Failed { artifact, error } => warn!("{artifact} failed: {error}"),
        }
    }
}
