//! Tracking rows: the per-row change metadata kept beside every base table.

use crate::{RowData, ScopeId, Version};
use serde::{Deserialize, Serialize};

/// Primary key values of one base row, in key-column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(Vec<serde_json::Value>);

impl RowKey {
    pub fn new(values: Vec<serde_json::Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[serde_json::Value] {
        &self.0
    }

    /// Canonical text form, usable as a map key.
    pub fn encoded(&self) -> String {
        serde_json::Value::Array(self.0.clone()).to_string()
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encoded())
    }
}

/// Change metadata for one live or deleted base row.
///
/// `update_scope_id` is `None` when the last write happened locally on this
/// participant, and the sending participant's scope id when the last write
/// was applied from a synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingRow {
    /// Primary key of the base row
    pub key: RowKey,
    /// Local clock version when the row was created
    pub create_timestamp: Version,
    /// Local clock version of the last change
    pub update_timestamp: Version,
    /// Participant that created the row (`None` = local)
    pub create_scope_id: Option<ScopeId>,
    /// Participant that last wrote the row (`None` = local)
    pub update_scope_id: Option<ScopeId>,
    /// The base row was deleted; metadata kept for propagation
    pub is_tombstone: bool,
    /// Denormalized copy of the filter column values
    #[serde(default)]
    pub filter_values: RowData,
}

impl TrackingRow {
    /// Metadata for a row that existed before tracking was enabled.
    ///
    /// Seeded rows sit at version 0 so they never look like pending changes.
    pub fn seeded(key: RowKey, filter_values: RowData) -> Self {
        Self {
            key,
            create_timestamp: 0,
            update_timestamp: 0,
            create_scope_id: None,
            update_scope_id: None,
            is_tombstone: false,
            filter_values,
        }
    }

    /// Metadata for a row inserted locally.
    pub fn local_insert(key: RowKey, version: Version, filter_values: RowData) -> Self {
        Self {
            create_timestamp: version,
            update_timestamp: version,
            ..Self::seeded(key, filter_values)
        }
    }

    pub fn is_live(&self) -> bool {
        !self.is_tombstone
    }

    /// Whether this participant wrote the row itself.
    pub fn is_local(&self) -> bool {
        self.update_scope_id.is_none()
    }

    /// Record a local update.
    pub fn mark_local_update(&mut self, version: Version, filter_values: RowData) {
        self.update_timestamp = version;
        self.update_scope_id = None;
        self.is_tombstone = false;
        self.filter_values = filter_values;
    }

    /// Record a local delete, keeping the row as a tombstone.
    pub fn mark_local_delete(&mut self, version: Version) {
        self.update_timestamp = version;
        self.update_scope_id = None;
        self.is_tombstone = true;
    }

    /// Record a write applied on behalf of `origin`.
    pub fn mark_applied(
        &mut self,
        version: Version,
        origin: Option<ScopeId>,
        is_tombstone: bool,
        filter_values: RowData,
    ) {
        self.update_timestamp = version;
        self.update_scope_id = origin;
        self.is_tombstone = is_tombstone;
        if !filter_values.is_empty() {
            self.filter_values = filter_values;
        }
    }

    /// Whether the row changed after `since` by someone other than `peer`.
    pub fn changed_since(&self, since: Version, peer: ScopeId) -> bool {
        self.update_timestamp > since && self.update_scope_id != Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn key(id: i64) -> RowKey {
        RowKey::new(vec![json!(id)])
    }

    #[test]
    fn encoded_key_is_canonical() {
        let key = RowKey::new(vec![json!(1), json!("a")]);
        assert_eq!(key.encoded(), r#"[1,"a"]"#);
        assert_eq!(key.to_string(), key.encoded());
    }

    #[test]
    fn seeded_rows_are_at_version_zero() {
        let row = TrackingRow::seeded(key(1), RowData::new());
        assert_eq!(row.create_timestamp, 0);
        assert_eq!(row.update_timestamp, 0);
        assert!(row.is_live());
        assert!(row.is_local());
    }

    #[test]
    fn local_lifecycle() {
        let mut row = TrackingRow::local_insert(key(1), 3, RowData::new());
        assert_eq!(row.create_timestamp, 3);

        row.mark_local_update(5, RowData::new());
        assert_eq!(row.update_timestamp, 5);
        assert_eq!(row.create_timestamp, 3);

        row.mark_local_delete(7);
        assert!(row.is_tombstone);
        assert_eq!(row.update_timestamp, 7);
    }

    #[test]
    fn applied_rows_remember_origin() {
        let peer = Uuid::new_v4();
        let mut row = TrackingRow::local_insert(key(1), 3, RowData::new());
        row.mark_applied(9, Some(peer), false, RowData::new());
        assert_eq!(row.update_scope_id, Some(peer));
        assert!(!row.is_local());
    }

    #[test]
    fn changed_since_ignores_peer_writes() {
        let peer = Uuid::new_v4();
        let mut row = TrackingRow::local_insert(key(1), 10, RowData::new());
        assert!(row.changed_since(5, peer));
        assert!(!row.changed_since(10, peer));

        row.mark_applied(12, Some(peer), false, RowData::new());
        assert!(!row.changed_since(5, peer));
        assert!(row.changed_since(5, Uuid::new_v4()));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut filters = RowData::new();
        filters.insert("clientId".into(), json!("g1"));
        let row = TrackingRow::local_insert(key(1), 4, filters);

        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("updateTimestamp"));
        let parsed: TrackingRow = serde_json::from_str(&json).unwrap();
        assert_eq!(row, parsed);
    }
}
