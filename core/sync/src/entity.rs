//! Synchronizable entity types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use tapedeck_common::{EntityId, Error};

/// Kind of synchronizable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    Recording,
    Tag,
    Album,
    Project,
    OverdubGroup,
}

impl EntityType {
    /// Upload order within a cycle: recordings, lightweight entities, projects.
    pub const UPLOAD_ORDER: [EntityType; 5] = [
        EntityType::Recording,
        EntityType::Tag,
        EntityType::Album,
        EntityType::OverdubGroup,
        EntityType::Project,
    ];

    /// Record type name on the remote store.
    pub fn record_type(&self) -> &'static str {
        match self {
            EntityType::Recording => "Recording",
            EntityType::Tag => "Tag",
            EntityType::Album => "Album",
            EntityType::Project => "Project",
            EntityType::OverdubGroup => "OverdubGroup",
        }
    }

    pub fn from_record_type(record_type: &str) -> Option<Self> {
        match record_type {
            "Recording" => Some(EntityType::Recording),
            "Tag" => Some(EntityType::Tag),
            "Album" => Some(EntityType::Album),
            "Project" => Some(EntityType::Project),
            "OverdubGroup" => Some(EntityType::OverdubGroup),
            _ => None,
        }
    }

    /// Lightweight entities are gated by content fingerprint, the others by
    /// modification date.
    pub fn is_lightweight(&self) -> bool {
        matches!(
            self,
            EntityType::Tag | EntityType::Album | EntityType::OverdubGroup
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.record_type())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::from_record_type(s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown entity type: {}", s)))
    }
}

/// An audio take with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: EntityId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub notes: String,
    pub tag_ids: Vec<EntityId>,
    pub album_id: Option<EntityId>,
    pub is_favorite: bool,
    /// Local asset name of the audio payload.
    pub audio_file: Option<String>,
    /// Content digest of the audio payload.
    pub audio_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: EntityId,
    pub name: String,
    pub color: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: EntityId,
    pub name: String,
    pub recording_ids: Vec<EntityId>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: EntityId,
    pub title: String,
    pub notes: String,
    pub recording_ids: Vec<EntityId>,
    pub tempo_bpm: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A base take with the layers recorded over it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdubGroup {
    pub id: EntityId,
    pub base_recording_id: EntityId,
    pub layer_recording_ids: Vec<EntityId>,
    pub modified_at: DateTime<Utc>,
}

/// Any entity the engine synchronizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SyncEntity {
    Recording(Recording),
    Tag(Tag),
    Album(Album),
    Project(Project),
    OverdubGroup(OverdubGroup),
}

impl SyncEntity {
    pub fn id(&self) -> &EntityId {
        match self {
            SyncEntity::Recording(e) => &e.id,
            SyncEntity::Tag(e) => &e.id,
            SyncEntity::Album(e) => &e.id,
            SyncEntity::Project(e) => &e.id,
            SyncEntity::OverdubGroup(e) => &e.id,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            SyncEntity::Recording(_) => EntityType::Recording,
            SyncEntity::Tag(_) => EntityType::Tag,
            SyncEntity::Album(_) => EntityType::Album,
            SyncEntity::Project(_) => EntityType::Project,
            SyncEntity::OverdubGroup(_) => EntityType::OverdubGroup,
        }
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        match self {
            SyncEntity::Recording(e) => e.modified_at,
            SyncEntity::Tag(e) => e.modified_at,
            SyncEntity::Album(e) => e.modified_at,
            SyncEntity::Project(e) => e.modified_at,
            SyncEntity::OverdubGroup(e) => e.modified_at,
        }
    }

    /// Local asset name, for entities carrying a binary payload.
    pub fn asset_name(&self) -> Option<&str> {
        match self {
            SyncEntity::Recording(e) => e.audio_file.as_deref(),
            _ => None,
        }
    }
}
