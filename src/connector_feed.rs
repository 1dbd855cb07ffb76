//! Generic JSON feed connector.
//!
//! Syncs a paginated HTTP API of the common "workspace feed" shape: each
//! configured workspace is an independently-paginated sub-resource, pages
//! carry a server-issued continuation token, and an optional detail
//! endpoint enriches entries after the listing (the detail record can lag
//! the listing that named it, so enrichment re-polls until complete).
//!
//! Endpoint shape:
//!
//! ```text
//! GET {base_url}/workspaces/{ws}/entries?limit=N[&cursor=..][&since=..&until=..]
//!     -> { "entries": [..], "next_cursor": ".." | null }
//! GET {base_url}/workspaces/{ws}/entries/details?ids=a,b,c
//!     -> { "details": [..] }
//! ```
//!
//! Credentials come from `INGEST_FEED_ACCESS_KEY` / `INGEST_FEED_ACCESS_SECRET`
//! and are sent as HTTP basic auth.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::checkpoint::{CursorCheckpoint, SyncCheckpoint};
use crate::config::FeedSourceConfig;
use crate::connector::{BaseConnector, CheckpointedConnector, SlimConnector, SyncStep};
use crate::error::SyncError;
use crate::failure::{isolate, FailurePolicy};
use crate::models::{stable_item_id, Item, ItemOrFailure, Section, SlimItem};
use crate::pagination::{fetch_one_page, Page, PageFetcher, PageOutcome};
use crate::retry::{retry, retry_until_complete, RetryPolicy};
use crate::window::{effective_window, TimeWindow};

const ACCESS_KEY_VAR: &str = "INGEST_FEED_ACCESS_KEY";
const ACCESS_SECRET_VAR: &str = "INGEST_FEED_ACCESS_SECRET";

/// One listing entry as the feed API returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    entries: Vec<FeedEntry>,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// One record from the detail endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedDetail {
    pub id: String,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    details: Vec<FeedDetail>,
}

/// Metadata keys and their accessors, applied uniformly to every entry.
/// Absent fields are simply omitted from the item's metadata map.
const METADATA_FIELDS: &[(&str, fn(&FeedEntry) -> Option<String>)] = &[
    ("author", |e| e.author.clone()),
    ("kind", |e| e.kind.clone()),
    ("language", |e| e.language.clone()),
    ("url", |e| e.url.clone()),
];

struct FeedCredentials {
    access_key: String,
    access_secret: String,
}

/// Process-wide credential cache, populated once under the write lock on
/// first use. [`reset_credential_cache`] is the invalidation path (e.g.
/// after rotating the environment).
static CREDENTIAL_CACHE: RwLock<Option<Arc<FeedCredentials>>> = RwLock::new(None);

/// Drop the cached feed credentials; the next request re-reads the
/// environment.
pub fn reset_credential_cache() {
    *CREDENTIAL_CACHE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
}

impl FeedCredentials {
    fn cached() -> Result<Arc<Self>, SyncError> {
        if let Some(credentials) = CREDENTIAL_CACHE
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            return Ok(credentials.clone());
        }

        let mut guard = CREDENTIAL_CACHE
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(credentials) = guard.as_ref() {
            return Ok(credentials.clone());
        }
        let fresh = Arc::new(Self::from_env()?);
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    fn from_env() -> Result<Self, SyncError> {
        let access_key = std::env::var(ACCESS_KEY_VAR)
            .map_err(|_| SyncError::MissingCredential(ACCESS_KEY_VAR.to_string()))?;
        let access_secret = std::env::var(ACCESS_SECRET_VAR)
            .map_err(|_| SyncError::MissingCredential(ACCESS_SECRET_VAR.to_string()))?;
        Ok(Self {
            access_key,
            access_secret,
        })
    }

    fn basic_auth_header(&self) -> String {
        let token = BASE64.encode(format!("{}:{}", self.access_key, self.access_secret));
        format!("Basic {token}")
    }
}

pub struct FeedConnector {
    name: String,
    config: FeedSourceConfig,
    client: reqwest::Client,
    floor: Option<DateTime<Utc>>,
    lookback: Duration,
    policy: FailurePolicy,
    retry_policy: RetryPolicy,
}

impl FeedConnector {
    pub fn new(
        name: String,
        config: FeedSourceConfig,
        default_lookback: Duration,
        policy: FailurePolicy,
        retry_policy: RetryPolicy,
    ) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let floor = config
            .floor_date
            .as_deref()
            .map(|date| {
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc())
                    .map_err(|e| {
                        SyncError::Configuration(format!("invalid floor_date '{date}': {e}"))
                    })
            })
            .transpose()?;
        let lookback = config
            .lookback_secs
            .map(Duration::from_secs)
            .unwrap_or(default_lookback);

        Ok(Self {
            name,
            config,
            client,
            floor,
            lookback,
            policy,
            retry_policy,
        })
    }

    async fn fetch_entries_page(
        &self,
        workspace: &str,
        cursor: Option<&str>,
        window: TimeWindow,
    ) -> Result<PageOutcome<FeedEntry>, SyncError> {
        let credentials = FeedCredentials::cached()?;
        let url = format!(
            "{}/workspaces/{}/entries",
            self.config.base_url, workspace
        );

        let response = retry(self.retry_policy, || {
            let mut request = self
                .client
                .get(&url)
                .header("Authorization", credentials.basic_auth_header())
                .query(&[("limit", self.config.page_size.to_string())]);
            if let Some(cursor) = cursor {
                request = request.query(&[("cursor", cursor)]);
            }
            request = request.query(&[
                ("since", window.start.to_rfc3339()),
                ("until", window.end.to_rfc3339()),
            ]);
            async move {
                let response = request.send().await?;
                check_status(response).await
            }
        })
        .await?;

        let response = match response {
            Some(response) => response,
            None => {
                debug!(workspace, "workspace has no entries endpoint");
                return Ok(PageOutcome::SubResourceGone);
            }
        };

        let body: EntriesResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Upstream(format!("malformed entries response: {e}")))?;

        let page_full = body.entries.len() >= self.config.page_size;
        Ok(PageOutcome::Page(Page {
            items: body.entries,
            next_cursor: body.next_cursor,
            page_full,
        }))
    }

    /// Enrich a page of entries from the detail endpoint. Details are
    /// eventually consistent with the listing, so this re-polls until every
    /// listed id is covered.
    async fn fetch_details(
        &self,
        workspace: &str,
        ids: &[String],
    ) -> Result<HashMap<String, FeedDetail>, SyncError> {
        let credentials = FeedCredentials::cached()?;
        let url = format!(
            "{}/workspaces/{}/entries/details",
            self.config.base_url, workspace
        );
        let joined = ids.join(",");

        retry_until_complete(self.retry_policy, ids, || {
            let request = self
                .client
                .get(&url)
                .header("Authorization", credentials.basic_auth_header())
                .query(&[("ids", joined.as_str())]);
            async move {
                let response = request.send().await?;
                let response = match check_status(response).await? {
                    Some(response) => response,
                    None => return Ok(HashMap::new()),
                };
                let body: DetailsResponse = response
                    .json()
                    .await
                    .map_err(|e| SyncError::Upstream(format!("malformed details response: {e}")))?;
                Ok(body
                    .details
                    .into_iter()
                    .map(|detail| (detail.id.clone(), detail))
                    .collect())
            }
        })
        .await
    }

    fn entry_to_item(
        &self,
        workspace: &str,
        entry: &FeedEntry,
        detail: Option<&FeedDetail>,
    ) -> Item {
        let label = self.source_label();
        let id = stable_item_id(&label, &[workspace, &entry.id]);

        let mut sections = vec![Section {
            text: entry.body.clone(),
            link: entry.url.clone(),
        }];
        if let Some(transcript) = detail.and_then(|d| d.transcript.as_deref()) {
            sections.push(Section {
                text: transcript.to_string(),
                link: entry.url.clone(),
            });
        }

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("workspace".to_string(), workspace.to_string());
        for (key, accessor) in METADATA_FIELDS {
            if let Some(value) = accessor(entry) {
                metadata.insert((*key).to_string(), value);
            }
        }

        let owners = detail
            .map(|d| d.participants.clone())
            .unwrap_or_else(|| entry.author.iter().cloned().collect());

        Item {
            id,
            sections,
            source: label,
            semantic_identifier: entry.title.clone(),
            updated_at: Some(entry.updated_at),
            metadata,
            owners,
            access: None,
        }
    }

    async fn page_to_outcomes(
        &self,
        workspace: &str,
        entries: Vec<FeedEntry>,
    ) -> Result<Vec<ItemOrFailure>, SyncError> {
        let details = if self.config.fetch_details && !entries.is_empty() {
            let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
            Some(self.fetch_details(workspace, &ids).await?)
        } else {
            None
        };

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in &entries {
            let id = stable_item_id(&self.source_label(), &[workspace, &entry.id]);
            let detail = details.as_ref().and_then(|map| map.get(&entry.id));
            let built = build_entry(self, workspace, entry, detail);
            outcomes.push(isolate(self.policy, &id, built)?);
        }
        Ok(outcomes)
    }
}

fn build_entry(
    connector: &FeedConnector,
    workspace: &str,
    entry: &FeedEntry,
    detail: Option<&FeedDetail>,
) -> Result<Item, SyncError> {
    if entry.id.is_empty() {
        return Err(SyncError::ItemProcessing(
            "entry has an empty id".to_string(),
        ));
    }
    Ok(connector.entry_to_item(workspace, entry, detail))
}

/// Map an HTTP response to `Ok(Some)` on success, `Ok(None)` on 404, and a
/// typed error otherwise. 401/403 mean bad credentials and abort the run;
/// everything else is upstream trouble and eligible for retry.
async fn check_status(response: reqwest::Response) -> Result<Option<reqwest::Response>, SyncError> {
    match response.status() {
        status if status.is_success() => Ok(Some(response)),
        StatusCode::NOT_FOUND => Ok(None),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::MissingCredential(
            format!("feed API rejected credentials ({})", response.status()),
        )),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(SyncError::Upstream(format!(
                "feed API returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )))
        }
    }
}

struct FeedPageFetcher<'a> {
    connector: &'a FeedConnector,
    window: TimeWindow,
}

#[async_trait]
impl PageFetcher for FeedPageFetcher<'_> {
    type Raw = (usize, FeedEntry);

    fn sub_resource_count(&self) -> usize {
        self.connector.config.workspaces.len()
    }

    async fn fetch(
        &self,
        sub_resource: usize,
        cursor: Option<&str>,
    ) -> Result<PageOutcome<Self::Raw>, SyncError> {
        let workspace = &self.connector.config.workspaces[sub_resource];
        let outcome = self
            .connector
            .fetch_entries_page(workspace, cursor, self.window)
            .await?;
        Ok(match outcome {
            PageOutcome::SubResourceGone => PageOutcome::SubResourceGone,
            PageOutcome::Page(page) => PageOutcome::Page(Page {
                items: page
                    .items
                    .into_iter()
                    .map(|entry| (sub_resource, entry))
                    .collect(),
                next_cursor: page.next_cursor,
                page_full: page.page_full,
            }),
        })
    }
}

impl BaseConnector for FeedConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "feed"
    }

    fn validate_settings(&self) -> Result<(), SyncError> {
        FeedCredentials::cached()?;
        if !self.config.base_url.starts_with("http://")
            && !self.config.base_url.starts_with("https://")
        {
            return Err(SyncError::Configuration(format!(
                "feed base_url must be http(s): {}",
                self.config.base_url
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointedConnector for FeedConnector {
    type Checkpoint = CursorCheckpoint;

    async fn sync(
        &self,
        window: TimeWindow,
        checkpoint: CursorCheckpoint,
    ) -> Result<SyncStep<CursorCheckpoint>, SyncError> {
        let effective = effective_window(window, self.floor, self.lookback);
        let fetcher = FeedPageFetcher {
            connector: self,
            window: effective,
        };

        let step = fetch_one_page(&fetcher, &checkpoint).await?;

        // One page always belongs to one workspace.
        let mut outcomes = Vec::new();
        if let Some((sub_resource, _)) = step.items.first() {
            let workspace = self.config.workspaces[*sub_resource].clone();
            let entries: Vec<FeedEntry> = step.items.into_iter().map(|(_, e)| e).collect();
            outcomes = self.page_to_outcomes(&workspace, entries).await?;
        }

        Ok(SyncStep {
            outcomes,
            checkpoint: step.checkpoint,
        })
    }
}

#[async_trait]
impl SlimConnector for FeedConnector {
    /// Drive the same pagination to exhaustion, keeping only ids. One inner
    /// page becomes one yielded batch.
    async fn enumerate_all(
        &self,
        window: Option<TimeWindow>,
    ) -> Result<Vec<Vec<SlimItem>>, SyncError> {
        let window = window.unwrap_or_else(TimeWindow::unbounded);
        let effective = effective_window(window, self.floor, self.lookback);
        let fetcher = FeedPageFetcher {
            connector: self,
            window: effective,
        };

        let label = self.source_label();
        let mut batches = Vec::new();
        let mut checkpoint = CursorCheckpoint::fresh();
        while checkpoint.has_more() {
            let step = fetch_one_page(&fetcher, &checkpoint).await?;
            if !step.items.is_empty() {
                let batch: Vec<SlimItem> = step
                    .items
                    .iter()
                    .map(|(sub_resource, entry)| SlimItem {
                        id: stable_item_id(
                            &label,
                            &[&self.config.workspaces[*sub_resource], &entry.id],
                        ),
                        access: None,
                    })
                    .collect();
                batches.push(batch);
            }
            checkpoint = step.checkpoint;
        }
        Ok(batches)
    }
}
