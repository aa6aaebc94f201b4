use chrono::Utc;

pub type EntityId = i64;
pub type MetalakeId = i64;
pub type CatalogId = i64;
pub type UserId = i64;
pub type GroupId = i64;
pub type RoleId = i64;
pub type Version = i64;

/// Milliseconds since the epoch, as stored in `deleted_at` tombstone columns.
pub type Timestamp = i64;

/// Surrogate id that the ALL-METALAKES root securable object is stored under.
pub const ROOT_ENTITY_ID: EntityId = 0;

/// Parent id of rows that have no parent (metalakes).
pub const NO_PARENT_ID: EntityId = 0;

pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}
