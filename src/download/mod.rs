//! Download state: what each acquisition looks like from the outside
//!
//! An item (one track) moves through
//! `init → fetching-metadata → fetched-metadata → downloading → downloaded`,
//! and can drop to `failed` from any non-terminal stage. Each stage variant of
//! [`ItemState`] carries exactly the data that exists at that point, so a path
//! or a progress value can't be read before the download started.
//!
//! A group (release or playlist) tracks its own metadata lifecycle in
//! [`GroupPhase`]; once the track list is known its stage is derived from its
//! children on every read and never stored.

pub mod machine;
pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::FailureInfo;
use crate::source::{GroupMetadata, Kind, Service, TrackMetadata};
use crate::store::StoredAsset;

pub use manager::{DownloadManager, ManagerOptions, ManagerStats};

/// Idempotency key of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DownloadKey {
    pub service: Service,
    pub kind: Kind,
    pub id: u64,
}

impl DownloadKey {
    pub fn new(service: Service, kind: Kind, id: u64) -> Self {
        Self { service, kind, id }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.kind, self.id)
    }
}

/// Position of a download in its progression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Init,
    FetchingMetadata,
    FetchedMetadata,
    Downloading,
    Downloaded,
    Failed,
}

impl Stage {
    /// Place in the forward ordering; `Failed` sits outside it
    pub fn rank(self) -> Option<u8> {
        match self {
            Stage::Init => Some(0),
            Stage::FetchingMetadata => Some(1),
            Stage::FetchedMetadata => Some(2),
            Stage::Downloading => Some(3),
            Stage::Downloaded => Some(4),
            Stage::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Downloaded | Stage::Failed)
    }

    /// Forward moves only; `Failed` from anything not yet terminal
    pub fn can_transition_to(self, next: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Init => "init",
            Stage::FetchingMetadata => "fetching-metadata",
            Stage::FetchedMetadata => "fetched-metadata",
            Stage::Downloading => "downloading",
            Stage::Downloaded => "downloaded",
            Stage::Failed => "failed",
        })
    }
}

/// Per-stage state of one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum ItemState {
    Init,
    FetchingMetadata,
    FetchedMetadata {
        metadata: TrackMetadata,
    },
    Downloading {
        metadata: TrackMetadata,
        path: PathBuf,
        /// Fraction in `[0, 1]`
        progress: f64,
    },
    #[serde(rename_all = "camelCase")]
    Downloaded {
        metadata: TrackMetadata,
        path: PathBuf,
        cover_art: Option<StoredAsset>,
    },
    Failed {
        error: FailureInfo,
        metadata: Option<TrackMetadata>,
        path: Option<PathBuf>,
    },
}

impl ItemState {
    pub fn stage(&self) -> Stage {
        match self {
            ItemState::Init => Stage::Init,
            ItemState::FetchingMetadata => Stage::FetchingMetadata,
            ItemState::FetchedMetadata { .. } => Stage::FetchedMetadata,
            ItemState::Downloading { .. } => Stage::Downloading,
            ItemState::Downloaded { .. } => Stage::Downloaded,
            ItemState::Failed { .. } => Stage::Failed,
        }
    }

    pub fn metadata(&self) -> Option<&TrackMetadata> {
        match self {
            ItemState::FetchedMetadata { metadata }
            | ItemState::Downloading { metadata, .. }
            | ItemState::Downloaded { metadata, .. } => Some(metadata),
            ItemState::Failed { metadata, .. } => metadata.as_ref(),
            ItemState::Init | ItemState::FetchingMetadata => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            ItemState::Downloading { path, .. } | ItemState::Downloaded { path, .. } => Some(path),
            ItemState::Failed { path, .. } => path.as_deref(),
            _ => None,
        }
    }

    /// Only meaningful while downloading; a finished item reports `1.0`
    pub fn progress(&self) -> Option<f64> {
        match self {
            ItemState::Downloading { progress, .. } => Some(*progress),
            ItemState::Downloaded { .. } => Some(1.0),
            _ => None,
        }
    }

    pub fn cover_art(&self) -> Option<&StoredAsset> {
        match self {
            ItemState::Downloaded { cover_art, .. } => cover_art.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FailureInfo> {
        match self {
            ItemState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// One track's acquisition progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadItem {
    /// Identifier on the source service
    pub id: String,
    #[serde(flatten)]
    pub state: ItemState,
}

impl DownloadItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: ItemState::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    /// Move to `next` if the stage ordering allows it
    pub fn advance(&mut self, next: ItemState) -> bool {
        let (from, to) = (self.stage(), next.stage());
        if from.can_transition_to(to) {
            self.state = next;
            true
        } else {
            warn!("Ignoring {} -> {} for item {}", from, to, self.id);
            false
        }
    }

    /// Record progress; only increases are applied
    pub fn set_progress(&mut self, fraction: f64) -> bool {
        match &mut self.state {
            ItemState::Downloading { progress, .. } => {
                let fraction = fraction.clamp(0.0, 1.0);
                if fraction > *progress {
                    *progress = fraction;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// Metadata lifecycle of a group, before its children take over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum GroupPhase {
    Init,
    FetchingMetadata,
    FetchedMetadata { metadata: GroupMetadata },
    Failed { error: FailureInfo },
}

impl GroupPhase {
    pub fn stage(&self) -> Stage {
        match self {
            GroupPhase::Init => Stage::Init,
            GroupPhase::FetchingMetadata => Stage::FetchingMetadata,
            GroupPhase::FetchedMetadata { .. } => Stage::FetchedMetadata,
            GroupPhase::Failed { .. } => Stage::Failed,
        }
    }
}

/// One release/playlist's acquisition progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadGroup {
    pub id: String,
    pub phase: GroupPhase,
    /// In source order
    pub tracks: Vec<DownloadItem>,
}

impl DownloadGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: GroupPhase::Init,
            tracks: Vec::new(),
        }
    }

    pub fn metadata(&self) -> Option<&GroupMetadata> {
        match &self.phase {
            GroupPhase::FetchedMetadata { metadata } => Some(metadata),
            _ => None,
        }
    }

    /// Aggregate stage.
    ///
    /// Until the track list is known this is the group's own phase. After
    /// that: `failed` if any track failed, `downloaded` if every track is
    /// (an empty group included), `downloading` once any track got there.
    pub fn stage(&self) -> Stage {
        if !matches!(self.phase, GroupPhase::FetchedMetadata { .. }) {
            return self.phase.stage();
        }

        if self.tracks.iter().any(|t| t.stage() == Stage::Failed) {
            Stage::Failed
        } else if self.tracks.iter().all(|t| t.stage() == Stage::Downloaded) {
            Stage::Downloaded
        } else if self
            .tracks
            .iter()
            .any(|t| t.stage().rank() >= Stage::Downloading.rank())
        {
            Stage::Downloading
        } else {
            Stage::FetchedMetadata
        }
    }

    /// Whether nothing in the group will change any more
    pub fn is_settled(&self) -> bool {
        match self.phase {
            GroupPhase::Failed { .. } => true,
            GroupPhase::FetchedMetadata { .. } => self.tracks.iter().all(|t| t.stage().is_terminal()),
            _ => false,
        }
    }

    /// Move the group's own phase forward
    pub fn advance(&mut self, next: GroupPhase) -> bool {
        let (from, to) = (self.phase.stage(), next.stage());
        if from.can_transition_to(to) {
            self.phase = next;
            true
        } else {
            warn!("Ignoring {} -> {} for group {}", from, to, self.id);
            false
        }
    }
}

/// A tracked download of either kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Download {
    Item(DownloadItem),
    Group(DownloadGroup),
}

impl Download {
    pub fn new(kind: Kind, id: u64) -> Self {
        match kind {
            Kind::Track => Download::Item(DownloadItem::new(id.to_string())),
            Kind::Group => Download::Group(DownloadGroup::new(id.to_string())),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Download::Item(item) => item.stage(),
            Download::Group(group) => group.stage(),
        }
    }

    pub fn is_settled(&self) -> bool {
        match self {
            Download::Item(item) => item.stage().is_terminal(),
            Download::Group(group) => group.is_settled(),
        }
    }

    /// All track-level entries: the item itself, or the group's tracks
    pub fn items(&self) -> Vec<&DownloadItem> {
        match self {
            Download::Item(item) => vec![item],
            Download::Group(group) => group.tracks.iter().collect(),
        }
    }

    /// Content store assets this download holds a reference to
    pub fn asset_ids(&self) -> Vec<u64> {
        self.items()
            .into_iter()
            .filter_map(|i| i.state.cover_art().map(|a| a.id))
            .collect()
    }
}

/// Point-in-time view of a download, as published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub key: DownloadKey,
    /// Incremented each time the key is started afresh
    pub run: u64,
    pub started_at: DateTime<Utc>,
    pub stage: Stage,
    #[serde(flatten)]
    pub download: Download,
}

impl Snapshot {
    /// Terminal and with no track still running
    pub fn is_finished(&self) -> bool {
        self.download.is_settled()
    }

    pub fn handle(&self) -> DownloadHandle {
        DownloadHandle {
            key: self.key,
            run: self.run,
        }
    }
}

/// What `start_download` hands back: which run of which key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadHandle {
    pub key: DownloadKey,
    pub run: u64,
}

/// Published on every change to the download table
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// A transition or progress update
    Updated(Snapshot),
    /// A finished download was dropped from the table
    Removed(DownloadKey),
}

impl DownloadEvent {
    pub fn key(&self) -> DownloadKey {
        match self {
            DownloadEvent::Updated(snapshot) => snapshot.key,
            DownloadEvent::Removed(key) => *key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DownloadError;
    use crate::source::mock::{group_meta, track_meta};

    fn downloaded(id: &str) -> DownloadItem {
        DownloadItem {
            id: id.to_string(),
            state: ItemState::Downloaded {
                metadata: track_meta(id, "t"),
                path: PathBuf::from(format!("/tmp/{}.mp3", id)),
                cover_art: None,
            },
        }
    }

    fn downloading(id: &str) -> DownloadItem {
        DownloadItem {
            id: id.to_string(),
            state: ItemState::Downloading {
                metadata: track_meta(id, "t"),
                path: PathBuf::from(format!("/tmp/{}.mp3", id)),
                progress: 0.5,
            },
        }
    }

    fn failed(id: &str) -> DownloadItem {
        DownloadItem {
            id: id.to_string(),
            state: ItemState::Failed {
                error: DownloadError::transient("timeout").into(),
                metadata: None,
                path: None,
            },
        }
    }

    fn fetched_group(ids: &[&str], tracks: Vec<DownloadItem>) -> DownloadGroup {
        DownloadGroup {
            id: "9".into(),
            phase: GroupPhase::FetchedMetadata {
                metadata: group_meta("9", ids),
            },
            tracks,
        }
    }

    #[test]
    fn test_stage_transitions_are_forward_only() {
        assert!(Stage::Init.can_transition_to(Stage::FetchingMetadata));
        assert!(Stage::FetchedMetadata.can_transition_to(Stage::Downloading));
        assert!(!Stage::Downloading.can_transition_to(Stage::FetchedMetadata));
        assert!(!Stage::Downloading.can_transition_to(Stage::Downloading));
    }

    #[test]
    fn test_failed_is_reachable_and_terminal() {
        for stage in [
            Stage::Init,
            Stage::FetchingMetadata,
            Stage::FetchedMetadata,
            Stage::Downloading,
        ] {
            assert!(stage.can_transition_to(Stage::Failed), "{}", stage);
        }
        assert!(!Stage::Downloaded.can_transition_to(Stage::Failed));
        assert!(!Stage::Failed.can_transition_to(Stage::Downloaded));
        assert!(!Stage::Failed.can_transition_to(Stage::Failed));
    }

    #[test]
    fn test_item_rejects_backwards_move() {
        let mut item = downloading("1");
        assert!(!item.advance(ItemState::FetchingMetadata));
        assert_eq!(item.stage(), Stage::Downloading);
    }

    #[test]
    fn test_progress_only_increases() {
        let mut item = downloading("1");
        assert!(item.set_progress(0.7));
        assert!(!item.set_progress(0.7));
        assert!(!item.set_progress(0.2));
        assert!(item.set_progress(3.0));
        assert_eq!(item.state.progress(), Some(1.0));

        let mut idle = DownloadItem::new("2");
        assert!(!idle.set_progress(0.5));
        assert_eq!(idle.state.progress(), None);
    }

    #[test]
    fn test_path_unavailable_before_downloading() {
        let mut item = DownloadItem::new("1");
        assert!(item.state.path().is_none());
        item.advance(ItemState::FetchingMetadata);
        item.advance(ItemState::FetchedMetadata {
            metadata: track_meta("1", "t"),
        });
        assert!(item.state.path().is_none());
        assert!(item.state.metadata().is_some());
    }

    #[test]
    fn test_empty_group_is_downloaded() {
        let group = fetched_group(&[], vec![]);
        assert_eq!(group.stage(), Stage::Downloaded);
        assert!(group.is_settled());
    }

    #[test]
    fn test_group_stage_before_metadata() {
        let mut group = DownloadGroup::new("9");
        assert_eq!(group.stage(), Stage::Init);
        group.advance(GroupPhase::FetchingMetadata);
        assert_eq!(group.stage(), Stage::FetchingMetadata);
        assert!(!group.is_settled());
    }

    #[test]
    fn test_group_aggregation() {
        let all_done = fetched_group(&["a", "b"], vec![downloaded("a"), downloaded("b")]);
        assert_eq!(all_done.stage(), Stage::Downloaded);

        let partial = fetched_group(&["a", "b"], vec![downloaded("a"), downloading("b")]);
        assert_eq!(partial.stage(), Stage::Downloading);
        assert!(!partial.is_settled());

        let waiting = fetched_group(&["a"], vec![DownloadItem::new("a")]);
        assert_eq!(waiting.stage(), Stage::FetchedMetadata);

        let broken = fetched_group(&["a", "b"], vec![failed("a"), downloading("b")]);
        assert_eq!(broken.stage(), Stage::Failed);
        assert!(!broken.is_settled());

        let settled = fetched_group(&["a", "b"], vec![failed("a"), downloaded("b")]);
        assert_eq!(settled.stage(), Stage::Failed);
        assert!(settled.is_settled());
    }

    #[test]
    fn test_item_wire_format() {
        let value = serde_json::to_value(DownloadItem::new("42")).unwrap();
        assert_eq!(value, serde_json::json!({"id": "42", "stage": "init"}));

        let value = serde_json::to_value(downloading("7")).unwrap();
        assert_eq!(value["stage"], "downloading");
        assert_eq!(value["progress"], 0.5);
        assert_eq!(value["metadata"]["sourceId"], "7");
    }

    #[test]
    fn test_snapshot_round_trip() {
        let snapshot = Snapshot {
            key: DownloadKey::new(Service::Soundcloud, Kind::Group, 9),
            run: 3,
            started_at: Utc::now(),
            stage: Stage::Downloading,
            download: Download::Group(fetched_group(&["a"], vec![downloading("a")])),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
