//! Translation between local entities and remote records.
//!
//! `write_fields` only touches locally-owned fields, so it can be applied on
//! top of the latest server version of a record during conflict resolution.
//! The audio asset itself is attached by the upload pipeline, never here.

use chrono::{DateTime, Utc};

use tapedeck_common::{EntityId, Error, FieldValue, RecordId, RemoteRecord, Result, ZoneId};

use crate::entity::{Album, EntityType, OverdubGroup, Project, Recording, SyncEntity, Tag};

/// Field names on remote records.
pub mod fields {
    pub const TITLE: &str = "title";
    pub const NAME: &str = "name";
    pub const COLOR: &str = "color";
    pub const NOTES: &str = "notes";
    pub const CREATED_AT: &str = "createdAt";
    pub const MODIFIED_AT: &str = "modifiedAt";
    pub const DURATION: &str = "duration";
    pub const TAG_IDS: &str = "tagIds";
    pub const ALBUM_ID: &str = "albumId";
    pub const FAVORITE: &str = "isFavorite";
    pub const AUDIO: &str = "audio";
    pub const AUDIO_FILE: &str = "audioFile";
    pub const AUDIO_DIGEST: &str = "audioDigest";
    pub const RECORDING_IDS: &str = "recordingIds";
    pub const TEMPO: &str = "tempoBpm";
    pub const BASE_RECORDING_ID: &str = "baseRecordingId";
    pub const LAYER_IDS: &str = "layerRecordingIds";
}

use fields::*;

/// Remote address of an entity.
pub fn record_id(zone: &ZoneId, entity_type: EntityType, id: &EntityId) -> RecordId {
    RecordId::new(zone.clone(), entity_type.record_type(), id.as_str())
}

/// Build a fresh record holding every mapped field of `entity`.
pub fn to_record(entity: &SyncEntity, zone: &ZoneId) -> RemoteRecord {
    let mut record = RemoteRecord::new(record_id(zone, entity.entity_type(), entity.id()));
    write_fields(entity, &mut record);
    record
}

/// Overwrite the locally-owned fields of `record` with the values of `entity`.
pub fn write_fields(entity: &SyncEntity, record: &mut RemoteRecord) {
    match entity {
        SyncEntity::Recording(r) => {
            record.set(TITLE, FieldValue::String(r.title.clone()));
            record.set(CREATED_AT, FieldValue::Date(r.created_at));
            record.set(MODIFIED_AT, FieldValue::Date(r.modified_at));
            record.set(DURATION, FieldValue::Double(r.duration_secs));
            record.set(NOTES, FieldValue::String(r.notes.clone()));
            record.set(TAG_IDS, id_list(&r.tag_ids));
            set_optional(record, ALBUM_ID, r.album_id.as_ref().map(|id| id.to_string()));
            record.set(FAVORITE, FieldValue::Bool(r.is_favorite));
            set_optional(record, AUDIO_FILE, r.audio_file.clone());
            set_optional(record, AUDIO_DIGEST, r.audio_digest.clone());
            if r.audio_file.is_none() {
                record.remove(AUDIO);
            }
        }
        SyncEntity::Tag(t) => {
            record.set(NAME, FieldValue::String(t.name.clone()));
            record.set(COLOR, FieldValue::String(t.color.clone()));
            record.set(MODIFIED_AT, FieldValue::Date(t.modified_at));
        }
        SyncEntity::Album(a) => {
            record.set(NAME, FieldValue::String(a.name.clone()));
            record.set(RECORDING_IDS, id_list(&a.recording_ids));
            record.set(MODIFIED_AT, FieldValue::Date(a.modified_at));
        }
        SyncEntity::Project(p) => {
            record.set(TITLE, FieldValue::String(p.title.clone()));
            record.set(NOTES, FieldValue::String(p.notes.clone()));
            record.set(RECORDING_IDS, id_list(&p.recording_ids));
            match p.tempo_bpm {
                Some(bpm) => record.set(TEMPO, FieldValue::Double(bpm)),
                None => {
                    record.remove(TEMPO);
                }
            }
            record.set(CREATED_AT, FieldValue::Date(p.created_at));
            record.set(MODIFIED_AT, FieldValue::Date(p.modified_at));
        }
        SyncEntity::OverdubGroup(g) => {
            record.set(
                BASE_RECORDING_ID,
                FieldValue::String(g.base_recording_id.to_string()),
            );
            record.set(LAYER_IDS, id_list(&g.layer_recording_ids));
            record.set(MODIFIED_AT, FieldValue::Date(g.modified_at));
        }
    }
}

/// Decode a remote record into a local entity.
///
/// # Errors
/// - `CorruptRecord` for unknown record types and missing or mistyped fields
pub fn from_record(record: &RemoteRecord) -> Result<SyncEntity> {
    let entity_type = EntityType::from_record_type(record.record_type()).ok_or_else(|| {
        Error::CorruptRecord(format!("{}: unknown record type", record.id))
    })?;
    let id = EntityId::new(record.name())
        .map_err(|_| Error::CorruptRecord(format!("{}: empty record name", record.id)))?;

    let entity = match entity_type {
        EntityType::Recording => SyncEntity::Recording(Recording {
            id,
            title: required_string(record, TITLE)?,
            created_at: required_date(record, CREATED_AT)?,
            modified_at: required_date(record, MODIFIED_AT)?,
            duration_secs: record
                .double(DURATION)
                .ok_or_else(|| missing(record, DURATION))?,
            notes: record.string(NOTES).unwrap_or_default().to_string(),
            tag_ids: id_vec(record, TAG_IDS)?,
            album_id: optional_id(record, ALBUM_ID)?,
            is_favorite: record.bool(FAVORITE).unwrap_or(false),
            audio_file: record.string(AUDIO_FILE).map(str::to_string),
            audio_digest: record.string(AUDIO_DIGEST).map(str::to_string),
        }),
        EntityType::Tag => SyncEntity::Tag(Tag {
            id,
            name: required_string(record, NAME)?,
            color: required_string(record, COLOR)?,
            modified_at: required_date(record, MODIFIED_AT)?,
        }),
        EntityType::Album => SyncEntity::Album(Album {
            id,
            name: required_string(record, NAME)?,
            recording_ids: id_vec(record, RECORDING_IDS)?,
            modified_at: required_date(record, MODIFIED_AT)?,
        }),
        EntityType::Project => SyncEntity::Project(Project {
            id,
            title: required_string(record, TITLE)?,
            notes: record.string(NOTES).unwrap_or_default().to_string(),
            recording_ids: id_vec(record, RECORDING_IDS)?,
            tempo_bpm: record.double(TEMPO),
            created_at: required_date(record, CREATED_AT)?,
            modified_at: required_date(record, MODIFIED_AT)?,
        }),
        EntityType::OverdubGroup => SyncEntity::OverdubGroup(OverdubGroup {
            id,
            base_recording_id: optional_id(record, BASE_RECORDING_ID)?
                .ok_or_else(|| missing(record, BASE_RECORDING_ID))?,
            layer_recording_ids: id_vec(record, LAYER_IDS)?,
            modified_at: required_date(record, MODIFIED_AT)?,
        }),
    };
    Ok(entity)
}

fn id_list(ids: &[EntityId]) -> FieldValue {
    FieldValue::StringList(ids.iter().map(|id| id.to_string()).collect())
}

fn set_optional(record: &mut RemoteRecord, field: &str, value: Option<String>) {
    match value {
        Some(v) => record.set(field, FieldValue::String(v)),
        None => {
            record.remove(field);
        }
    }
}

fn missing(record: &RemoteRecord, field: &str) -> Error {
    Error::CorruptRecord(format!("{}: missing field {}", record.id, field))
}

fn required_string(record: &RemoteRecord, field: &str) -> Result<String> {
    record
        .string(field)
        .map(str::to_string)
        .ok_or_else(|| missing(record, field))
}

fn required_date(record: &RemoteRecord, field: &str) -> Result<DateTime<Utc>> {
    record.date(field).ok_or_else(|| missing(record, field))
}

fn optional_id(record: &RemoteRecord, field: &str) -> Result<Option<EntityId>> {
    match record.string(field) {
        Some(raw) => EntityId::new(raw)
            .map(Some)
            .map_err(|_| Error::CorruptRecord(format!("{}: empty id in {}", record.id, field))),
        None => Ok(None),
    }
}

fn id_vec(record: &RemoteRecord, field: &str) -> Result<Vec<EntityId>> {
    record
        .string_list(field)
        .unwrap_or_default()
        .iter()
        .map(|raw| {
            EntityId::new(raw.as_str()).map_err(|_| {
                Error::CorruptRecord(format!("{}: empty id in {}", record.id, field))
            })
        })
        .collect()
}
