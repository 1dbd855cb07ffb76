//! Source registry: turns configuration into runnable source instances.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::connector::SourceRuntime;
use crate::connector_feed::FeedConnector;
use crate::connector_fs::FsConnector;
use crate::error::SyncError;

/// Build a [`SourceRuntime`] for every configured source instance.
///
/// Construction errors (bad globs, bad floor dates) surface here, before
/// any scheduling; missing credentials do not, because they are a
/// pre-flight concern checked per cycle.
pub fn build_sources(config: &Config) -> Result<Vec<SourceRuntime>, SyncError> {
    let lookback = Duration::from_secs(config.sync.default_lookback_secs);
    let policy = config.sync.failure_policy();
    let retry_policy = config.retry.policy();

    let mut sources = Vec::new();

    for (name, fs_config) in &config.sources.filesystem {
        let connector = Arc::new(FsConnector::new(
            name.clone(),
            fs_config.clone(),
            lookback,
            policy,
        )?);
        sources.push(
            SourceRuntime::new(format!("filesystem:{name}"))
                .with_load(connector.clone())
                .with_poll(connector.clone())
                .with_checkpointed(connector.clone())
                .with_slim(connector.clone())
                .with_perm_sync(connector),
        );
    }

    for (name, feed_config) in &config.sources.feed {
        let connector = Arc::new(FeedConnector::new(
            name.clone(),
            feed_config.clone(),
            lookback,
            policy,
            retry_policy,
        )?);
        sources.push(
            SourceRuntime::new(format!("feed:{name}"))
                .with_checkpointed(connector.clone())
                .with_slim(connector),
        );
    }

    Ok(sources)
}

/// Print every configured source with its capability tags and whether its
/// pre-flight check passes.
pub fn list_sources(config: &Config) -> Result<(), SyncError> {
    let sources = build_sources(config)?;
    if sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    for source in &sources {
        let caps: Vec<&str> = source
            .capabilities()
            .iter()
            .map(|capability| capability.as_str())
            .collect();
        let health = match source.validate_settings() {
            Ok(()) => "ok".to_string(),
            Err(err) => format!("unavailable ({err})"),
        };
        println!("{:<30} [{}] {}", source.label(), caps.join(", "), health);
    }
    Ok(())
}

/// Find one source by its `"{type}:{name}"` label.
pub fn find_source(sources: &[SourceRuntime], label: &str) -> Result<SourceRuntime, SyncError> {
    sources
        .iter()
        .find(|source| source.label() == label)
        .cloned()
        .ok_or_else(|| {
            let known: Vec<&str> = sources.iter().map(|s| s.label()).collect();
            SyncError::Configuration(format!(
                "unknown source '{label}' (configured: {})",
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            ))
        })
}
