use crate::{
    api::{CatalogClient, ListingPage, ListingQuery},
    database::Database,
    model::{deserialise_items, now_timestamp},
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::{mpsc::Sender, Arc};
use tokio::runtime::Runtime;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncSignal {
    Page {
        number: usize,
        models: usize,
        versions: usize,
        files: usize,
        images: usize,
    },
    Finished {
        pages: usize,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pages: usize,
    pub models: usize,
    pub versions: usize,
    pub files: usize,
    pub images: usize,
}

#[derive(Debug)]
pub struct CatalogService {
    runtime: Arc<Runtime>,
    client: CatalogClient,
    database: Arc<Database>,
}

impl CatalogService {
    pub fn new(runtime: Arc<Runtime>, client: CatalogClient, database: Arc<Database>) -> Self {
        Self {
            runtime,
            client,
            database,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// Walks the listing until it runs out of pages or `max_pages` have been stored.
    pub fn sync(
        &self,
        query: ListingQuery,
        max_pages: Option<usize>,
        progress: Sender<SyncSignal>,
    ) -> tokio::task::JoinHandle<Result<SyncReport>> {
        let client = self.client.clone();
        let database = self.database.clone();
        self.runtime.spawn(async move {
            let report = run_sync(&client, database, query, max_pages, &progress).await?;
            info!(
                "Synced {} pages from {}: {} models, {} versions, {} files, {} images",
                report.pages,
                client.endpoint(),
                report.models,
                report.versions,
                report.files,
                report.images
            );
            let _ = progress.send(SyncSignal::Finished {
                pages: report.pages,
            });
            Ok(report)
        })
    }
}

async fn run_sync(
    client: &CatalogClient,
    database: Arc<Database>,
    mut query: ListingQuery,
    max_pages: Option<usize>,
    progress: &Sender<SyncSignal>,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();
    let mut last_page_url: Option<String> = None;
    let mut listing = client.fetch_page(&query).await?;

    loop {
        let ListingPage {
            items,
            next_cursor,
            next_page,
        } = listing;

        let page = deserialise_items(&items, now_timestamp())
            .with_context(|| format!("failed to map page {} of the listing", report.pages + 1))?;
        report.pages += 1;
        report.models += page.models.len();
        report.versions += page.versions.len();
        report.files += page.files.len();
        report.images += page.images.len();
        info!("Page {}: {}", report.pages, page.summary());
        let _ = progress.send(SyncSignal::Page {
            number: report.pages,
            models: page.models.len(),
            versions: page.versions.len(),
            files: page.files.len(),
            images: page.images.len(),
        });

        let db = database.clone();
        tokio::task::spawn_blocking(move || db.insert_page(&page))
            .await
            .context("database insert task panicked")??;

        if items.is_empty() || max_pages.is_some_and(|max| report.pages >= max) {
            break;
        }

        listing = match (next_cursor, next_page) {
            (Some(cursor), _) => {
                if query.cursor.as_deref() == Some(cursor.as_str()) {
                    warn!("Listing repeated cursor {cursor}, stopping");
                    break;
                }
                query.cursor = Some(cursor);
                client.fetch_page(&query).await?
            }
            (None, Some(url)) => {
                if last_page_url.as_deref() == Some(url.as_str()) {
                    warn!("Listing repeated next page {url}, stopping");
                    break;
                }
                let listing = client.fetch_next(&url).await?;
                last_page_url = Some(url);
                listing
            }
            (None, None) => break,
        };
    }

    Ok(report)
}
