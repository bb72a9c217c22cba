// External propagation data feeds
//
// A feed yields a ParametersDelta (new solar flux and/or K-index). Feeds are
// fetched from a spawned task so the update loop never waits on them.
// Failures leave the ionospheric state untouched.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ExternalDataError;
use crate::events::{EventBus, PropagationEvent};
use crate::propagation::ionosphere::{ExternalSourceFlags, IonosphericModel};

pub type FeedFuture<'a> = Pin<Box<dyn Future<Output = Result<ParametersDelta, ExternalDataError>> + Send + 'a>>;

/// New parameter values reported by a feed. Absent fields are left as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParametersDelta {
    #[serde(default, alias = "sfi", alias = "solarFluxIndex")]
    pub solar_flux_index: Option<i32>,
    #[serde(default, alias = "k", alias = "kIndex")]
    pub k_index: Option<i32>,
}

impl ParametersDelta {
    pub fn is_empty(&self) -> bool {
        self.solar_flux_index.is_none() && self.k_index.is_none()
    }
}

pub trait PropagationFeed: Send + Sync {
    fn name(&self) -> &str;
    fn fetch(&self) -> FeedFuture<'_>;
}

/// Feed backed by a JSON document on disk, refreshed by whatever external
/// job mirrors the upstream service.
pub struct FileFeed {
    name: String,
    path: PathBuf,
}

impl FileFeed {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        FileFeed {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PropagationFeed for FileFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> FeedFuture<'_> {
        Box::pin(async move {
            let text = tokio::fs::read_to_string(&self.path).await?;
            let delta: ParametersDelta = serde_json::from_str(&text)?;
            if delta.is_empty() {
                return Err(ExternalDataError::Unavailable {
                    source_name: self.name.clone(),
                    reason: "document carries no parameters".to_string(),
                });
            }
            Ok(delta)
        })
    }
}

/// Placeholder for a source that is enabled but has nowhere to read from.
pub struct UnconfiguredFeed {
    name: String,
}

impl UnconfiguredFeed {
    pub fn new(name: impl Into<String>) -> Self {
        UnconfiguredFeed { name: name.into() }
    }
}

impl PropagationFeed for UnconfiguredFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self) -> FeedFuture<'_> {
        Box::pin(async move {
            Err(ExternalDataError::Unavailable {
                source_name: self.name.clone(),
                reason: "no feed directory configured".to_string(),
            })
        })
    }
}

pub const DXVIEW_SOURCE: &str = "DXView";
pub const SWPC_SOURCE: &str = "SWPC";

/// Feeds selected by the source flags. DXView is consulted before SWPC, so
/// SWPC values win when both report.
pub fn feeds_for(flags: ExternalSourceFlags, feed_dir: Option<&Path>) -> Vec<Arc<dyn PropagationFeed>> {
    let mut feeds: Vec<Arc<dyn PropagationFeed>> = Vec::new();
    let mut add = |enabled: bool, name: &str, file: &str| {
        if !enabled {
            return;
        }
        match feed_dir {
            Some(dir) => feeds.push(Arc::new(FileFeed::new(name, dir.join(file)))),
            None => feeds.push(Arc::new(UnconfiguredFeed::new(name))),
        }
    };
    add(flags.dxview, DXVIEW_SOURCE, "dxview.json");
    add(flags.swpc, SWPC_SOURCE, "swpc.json");
    feeds
}

/// Fetch every feed in turn and apply what arrives. Returns true when any
/// feed succeeded.
pub async fn refresh_feeds(
    feeds: &[Arc<dyn PropagationFeed>],
    model: &IonosphericModel,
    events: &EventBus,
) -> bool {
    let mut any_success = false;
    for feed in feeds {
        let success = match feed.fetch().await {
            Ok(delta) => {
                let changed = model.apply_parameters(delta.solar_flux_index, delta.k_index);
                info!(
                    source = feed.name(),
                    sfi = ?delta.solar_flux_index,
                    k_index = ?delta.k_index,
                    changed,
                    "External data applied"
                );
                true
            }
            Err(e) => {
                warn!(source = feed.name(), "External data update failed: {}", e);
                false
            }
        };
        any_success |= success;
        events.publish(PropagationEvent::ExternalDataUpdated {
            source: feed.name().to_string(),
            success,
        });
    }
    any_success
}
