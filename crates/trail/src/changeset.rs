//! Changeset builder: attribute-level diffs with ignore/skip/only filtering

use serde_json::Value;
use tracing::warn;

use crate::codec::{AttributeCodec, StoredObject};
use crate::value::{AttributeValue, Attributes};

/// Attribute filters of one model, fixed at registration.
///
/// - `ignore`: never influences whether a version is recorded, never diffed
/// - `skip`: never stored in snapshots or diffs
/// - `only`: when non-empty, the exclusive set of tracked attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    ignore: Vec<String>,
    skip: Vec<String>,
    only: Vec<String>,
    update_timestamps: Vec<String>,
}

impl FilterPolicy {
    pub fn new(
        ignore: Vec<String>,
        skip: Vec<String>,
        only: Vec<String>,
        update_timestamps: Vec<String>,
    ) -> Self {
        Self {
            ignore,
            skip,
            only,
            update_timestamps,
        }
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|n| n == name)
    }

    pub fn is_skipped(&self, name: &str) -> bool {
        self.skip.iter().any(|n| n == name)
    }

    pub fn is_recordable(&self, name: &str) -> bool {
        !self.is_ignored(name)
            && !self.is_skipped(name)
            && (self.only.is_empty() || self.only.iter().any(|n| n == name))
    }

    /// Recordable attribute names, in the record's attribute order
    pub fn tracked_names(&self, attributes: &Attributes) -> Vec<String> {
        attributes
            .names()
            .filter(|name| self.is_recordable(name))
            .map(str::to_string)
            .collect()
    }

    /// Changed attributes that survive filtering
    pub fn notably_changed(&self, changed: &[String]) -> Vec<String> {
        changed
            .iter()
            .filter(|name| self.is_recordable(name))
            .cloned()
            .collect()
    }

    /// Whether a set of changed attributes is worth a version.
    ///
    /// When an ignored attribute changed, the automatic update timestamps
    /// moved along with it and do not count on their own.
    pub fn changed_notably(&self, changed: &[String]) -> bool {
        let notable = self.notably_changed(changed);
        if changed.iter().any(|name| self.is_ignored(name)) {
            notable
                .iter()
                .any(|name| !self.update_timestamps.contains(name))
        } else {
            !notable.is_empty()
        }
    }

    /// Attributes stored in an `object` snapshot
    pub fn snapshot_attributes(&self, attributes: &Attributes) -> Attributes {
        attributes.without(&self.skip)
    }
}

/// Old and new value of one attribute
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub name: String,
    pub old: AttributeValue,
    pub new: AttributeValue,
}

/// Ordered attribute changes of one update event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn get(&self, name: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Storage form: attribute name to `[old, new]`
    pub fn to_stored(&self, codec: &AttributeCodec<'_>) -> StoredObject {
        self.changes
            .iter()
            .map(|change| {
                let pair = Value::Array(vec![
                    codec.serialize_value(&change.name, &change.old),
                    codec.serialize_value(&change.name, &change.new),
                ]);
                (change.name.clone(), pair)
            })
            .collect()
    }

    /// Decode a stored changeset; malformed pairs keep the raw value as `new`
    pub fn from_stored(stored: &StoredObject, codec: &AttributeCodec<'_>) -> Self {
        let changes = stored
            .iter()
            .map(|(name, raw)| match raw.as_array().map(Vec::as_slice) {
                Some([old, new]) => Change {
                    name: name.clone(),
                    old: codec.deserialize_value(name, old),
                    new: codec.deserialize_value(name, new),
                },
                _ => {
                    warn!("Change for {} is not an [old, new] pair, keeping raw value", name);
                    Change {
                        name: name.clone(),
                        old: AttributeValue::Null,
                        new: AttributeValue::from_json(raw),
                    }
                }
            })
            .collect();
        Self { changes }
    }
}

impl FromIterator<Change> for Changeset {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        Self {
            changes: iter.into_iter().collect(),
        }
    }
}

/// Computes diffs between two attribute snapshots of one model
pub struct ChangesetBuilder<'a> {
    codec: AttributeCodec<'a>,
    policy: &'a FilterPolicy,
}

impl<'a> ChangesetBuilder<'a> {
    pub fn new(codec: AttributeCodec<'a>, policy: &'a FilterPolicy) -> Self {
        Self { codec, policy }
    }

    /// Names whose serialized form differs, in `after` order followed by
    /// names that only exist in `before`
    pub fn changed_names(&self, before: &Attributes, after: &Attributes) -> Vec<String> {
        let removed = before.names().filter(|name| !after.contains(name));
        after
            .names()
            .chain(removed)
            .filter(|name| self.differs(name, before, after))
            .map(str::to_string)
            .collect()
    }

    /// Changes restricted to `tracked`, in change-tracking order
    pub fn diff(&self, before: &Attributes, after: &Attributes, tracked: &[String]) -> Changeset {
        self.changed_names(before, after)
            .into_iter()
            .filter(|name| tracked.contains(name))
            .map(|name| Change {
                old: before.get(&name).cloned().unwrap_or(AttributeValue::Null),
                new: after.get(&name).cloned().unwrap_or(AttributeValue::Null),
                name,
            })
            .collect()
    }

    /// False when the only changes are to ignored or skipped attributes
    pub fn save_version(&self, before: &Attributes, after: &Attributes) -> bool {
        self.policy
            .changed_notably(&self.changed_names(before, after))
    }

    fn differs(&self, name: &str, before: &Attributes, after: &Attributes) -> bool {
        let null = AttributeValue::Null;
        let old = before.get(name).unwrap_or(&null);
        let new = after.get(name).unwrap_or(&null);
        self.codec.serialize_value(name, old) != self.codec.serialize_value(name, new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, Schema};

    fn schema() -> Schema {
        Schema::new()
            .column("id", ColumnType::Integer)
            .column("name", ColumnType::String)
            .column("price", ColumnType::Integer)
            .column("updated_at", ColumnType::Timestamp)
    }

    fn policy(ignore: &[&str], skip: &[&str], only: &[&str]) -> FilterPolicy {
        let owned = |names: &[&str]| names.iter().map(|n| n.to_string()).collect();
        FilterPolicy::new(
            owned(ignore),
            owned(skip),
            owned(only),
            vec!["updated_at".to_string()],
        )
    }

    #[test]
    fn test_diff_reports_only_changed_attributes() {
        let schema = schema();
        let policy = policy(&[], &[], &[]);
        let builder = ChangesetBuilder::new(AttributeCodec::new(&schema), &policy);

        let before = Attributes::new().with("name", "Widget").with("price", 10);
        let after = Attributes::new().with("name", "Widget").with("price", 12);
        let tracked = vec!["name".to_string(), "price".to_string()];

        let changes = builder.diff(&before, &after, &tracked);
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes.get("price"),
            Some(&Change {
                name: "price".into(),
                old: AttributeValue::Integer(10),
                new: AttributeValue::Integer(12),
            })
        );
        assert!(changes.get("name").is_none());
    }

    #[test]
    fn test_diff_follows_attribute_order() {
        let schema = schema();
        let policy = policy(&[], &[], &[]);
        let builder = ChangesetBuilder::new(AttributeCodec::new(&schema), &policy);

        let before = Attributes::new().with("price", 1).with("name", "a").with("id", 1);
        let after = Attributes::new().with("price", 2).with("name", "b").with("id", 1);
        let tracked = policy.tracked_names(&after);

        let changes = builder.diff(&before, &after, &tracked);
        assert_eq!(changes.names().collect::<Vec<_>>(), vec!["price", "name"]);
    }

    #[test]
    fn test_ignored_change_alone_is_not_worth_a_version() {
        let schema = schema();
        let policy = policy(&["price"], &[], &[]);
        let builder = ChangesetBuilder::new(AttributeCodec::new(&schema), &policy);

        let before = Attributes::new().with("name", "Widget").with("price", 10);
        let price_only = Attributes::new().with("name", "Widget").with("price", 12);
        assert!(!builder.save_version(&before, &price_only));

        let both = Attributes::new().with("name", "Gadget").with("price", 12);
        assert!(builder.save_version(&before, &both));
        let tracked = policy.tracked_names(&both);
        let changes = builder.diff(&before, &both, &tracked);
        assert_eq!(changes.names().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn test_timestamp_bump_with_ignored_change_is_not_notable() {
        let policy = policy(&["price"], &[], &[]);
        let changed = vec!["price".to_string(), "updated_at".to_string()];
        assert!(!policy.changed_notably(&changed));

        // Without an ignored change the timestamp counts
        assert!(policy.changed_notably(&["updated_at".to_string()]));
    }

    #[test]
    fn test_skip_excluded_from_diff_and_snapshot() {
        let policy = policy(&[], &["name"], &[]);
        assert!(!policy.changed_notably(&["name".to_string()]));
        assert!(policy.changed_notably(&["name".to_string(), "price".to_string()]));

        let attrs = Attributes::new().with("name", "x").with("price", 1);
        let snapshot = policy.snapshot_attributes(&attrs);
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["price"]);
    }

    #[test]
    fn test_only_restricts_tracked_names() {
        let policy = policy(&["price"], &[], &["name", "price"]);
        let attrs = Attributes::new()
            .with("id", 1)
            .with("name", "x")
            .with("price", 1);
        assert_eq!(policy.tracked_names(&attrs), vec!["name".to_string()]);
        assert!(!policy.changed_notably(&["id".to_string()]));
    }

    #[test]
    fn test_stored_changeset_round_trip() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let changes: Changeset = vec![Change {
            name: "price".into(),
            old: AttributeValue::Integer(10),
            new: AttributeValue::Integer(12),
        }]
        .into_iter()
        .collect();

        let stored = changes.to_stored(&codec);
        assert_eq!(stored["price"], serde_json::json!([10, 12]));
        assert_eq!(Changeset::from_stored(&stored, &codec), changes);
    }

    #[test]
    fn test_malformed_stored_change_is_kept_raw() {
        let schema = schema();
        let codec = AttributeCodec::new(&schema);
        let mut stored = StoredObject::new();
        stored.insert("price".into(), serde_json::json!(12));

        let changes = Changeset::from_stored(&stored, &codec);
        assert_eq!(changes.get("price").map(|c| &c.new), Some(&AttributeValue::Integer(12)));
    }
}
