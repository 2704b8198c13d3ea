//! Mapping from finished segment trees to flat wire records.
//!
//! Runs once per transaction, at finalize. The tree is walked root-first and
//! every exportable segment becomes one [`SpanRecord`]: ignored segments drop
//! out together with their subtrees, opaque segments export themselves but
//! hide their descendants, and segments still open when the transaction ends
//! are exported with a truncation marker and a duration measured up to the
//! finalize time.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::ids::{SegmentId, TraceId};
use crate::operation::Category;
use crate::segment::{SegmentHandle, SegmentSnapshot};
use crate::transaction::NoticedError;
use crate::{KeyValue, Value};

/// Name prefix applied to segments still open when their transaction ends.
const TRUNCATED_PREFIX: &str = "Truncated/";

/// A scalar span attribute, tagged with its kind on the wire.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum WireValue {
    /// A string value.
    #[serde(rename = "string_value")]
    String(String),
    /// A boolean value.
    #[serde(rename = "bool_value")]
    Bool(bool),
    /// A 64-bit integer value.
    #[serde(rename = "int_value")]
    Int(i64),
    /// A double precision floating point value.
    #[serde(rename = "double_value")]
    Double(f64),
}

impl From<Value> for WireValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => WireValue::Bool(b),
            Value::I64(i) => WireValue::Int(i),
            Value::F64(f) => WireValue::Double(f),
            Value::String(s) => WireValue::String(s.to_string()),
        }
    }
}

/// One exported segment, in the shape the ingest endpoint accepts.
///
/// `intrinsics` always carries the keys `type`, `category`, `guid`,
/// `parentId`, `transactionId`, `sampled`, `priority`, `name`, `timestamp`
/// and `duration`; datastore and external segments additionally carry
/// `component` and `span.kind`.
#[derive(Clone, Debug, Serialize)]
pub struct SpanRecord {
    /// The trace this span belongs to.
    pub trace_id: String,
    /// Typed span metadata required by the wire format.
    pub intrinsics: BTreeMap<&'static str, WireValue>,
    /// Attributes supplied by application code.
    pub user_attributes: BTreeMap<String, WireValue>,
    /// Attributes captured by instrumentation and the agent itself.
    pub agent_attributes: BTreeMap<String, WireValue>,
}

/// Per-transaction facts every record needs, snapshotted at finalize.
#[derive(Debug)]
pub(crate) struct TransactionMeta {
    pub(crate) trace_id: TraceId,
    pub(crate) guid: SegmentId,
    pub(crate) sampled: bool,
    pub(crate) priority: f64,
    pub(crate) noticed_error: Option<NoticedError>,
    pub(crate) route_params: Vec<KeyValue>,
}

/// Maps the tree under `root` to wire records in root-first order.
///
/// `name_override` replaces the root segment's name, carrying the
/// transaction's final display name onto its root span.
pub(crate) fn build_records(
    root: &SegmentHandle,
    meta: &TransactionMeta,
    finalize_time: SystemTime,
    name_override: Option<String>,
) -> Vec<SpanRecord> {
    let mut records = Vec::new();
    append_records(root, None, meta, finalize_time, name_override, &mut records);
    records
}

fn append_records(
    segment: &SegmentHandle,
    parent: Option<SegmentId>,
    meta: &TransactionMeta,
    finalize_time: SystemTime,
    name_override: Option<String>,
    records: &mut Vec<SpanRecord>,
) {
    let Some(snapshot) = segment.snapshot() else {
        return;
    };
    if snapshot.ignore {
        return;
    }

    records.push(to_record(&snapshot, parent, meta, finalize_time, name_override));

    if snapshot.opaque {
        return;
    }
    for child in &snapshot.children {
        append_records(child, Some(snapshot.id), meta, finalize_time, None, records);
    }
}

fn to_record(
    snapshot: &SegmentSnapshot,
    parent: Option<SegmentId>,
    meta: &TransactionMeta,
    finalize_time: SystemTime,
    name_override: Option<String>,
) -> SpanRecord {
    let truncated = snapshot.end_time.is_none();
    let name = match name_override {
        Some(name) => Cow::Owned(name),
        None => snapshot.name.clone(),
    };
    let name = if truncated {
        format!("{}{}", TRUNCATED_PREFIX, name)
    } else {
        name.into_owned()
    };
    let end_time = snapshot.end_time.unwrap_or(finalize_time);
    let duration = end_time
        .duration_since(snapshot.start_time)
        .unwrap_or(Duration::ZERO);
    // The root has no parent segment; its record points at the transaction
    // itself so the exported tree stays stitchable.
    let parent_id = match parent {
        Some(id) => id.to_string(),
        None => meta.guid.to_string(),
    };

    let mut intrinsics = BTreeMap::new();
    intrinsics.insert("type", WireValue::String("Span".to_owned()));
    intrinsics.insert("guid", WireValue::String(snapshot.id.to_string()));
    intrinsics.insert("parentId", WireValue::String(parent_id));
    intrinsics.insert("transactionId", WireValue::String(meta.guid.to_string()));
    intrinsics.insert("sampled", WireValue::Bool(meta.sampled));
    intrinsics.insert("priority", WireValue::Double(meta.priority));
    intrinsics.insert("name", WireValue::String(name));
    intrinsics.insert("timestamp", WireValue::Int(epoch_millis(snapshot.start_time)));
    intrinsics.insert("duration", WireValue::Double(duration.as_secs_f64()));
    insert_category(&snapshot.category, &mut intrinsics);

    let mut agent_attributes: BTreeMap<String, WireValue> = snapshot
        .attributes
        .iter()
        .cloned()
        .map(|kv| (kv.key.as_str().to_owned(), WireValue::from(kv.value)))
        .collect();
    let user_attributes = snapshot
        .custom_attributes
        .iter()
        .cloned()
        .map(|kv| (kv.key.as_str().to_owned(), WireValue::from(kv.value)))
        .collect();

    // Transaction-level facts ride on the root span.
    if parent.is_none() {
        if let Some(error) = &meta.noticed_error {
            agent_attributes.insert(
                "error.message".to_owned(),
                WireValue::String(error.message.clone()),
            );
            agent_attributes.insert("error.handled".to_owned(), WireValue::Bool(error.handled));
        }
        for kv in meta.route_params.iter().cloned() {
            agent_attributes.insert(
                format!("request.parameters.route.{}", kv.key.as_str()),
                WireValue::from(kv.value),
            );
        }
    }

    SpanRecord {
        trace_id: meta.trace_id.to_string(),
        intrinsics,
        user_attributes,
        agent_attributes,
    }
}

fn insert_category(category: &Category, intrinsics: &mut BTreeMap<&'static str, WireValue>) {
    match category {
        Category::Generic => {
            intrinsics.insert("category", WireValue::String("generic".to_owned()));
        }
        Category::Datastore { product } => {
            intrinsics.insert("category", WireValue::String("datastore".to_owned()));
            intrinsics.insert("component", WireValue::String(product.clone().into_owned()));
            intrinsics.insert("span.kind", WireValue::String("client".to_owned()));
        }
        Category::External { library } => {
            intrinsics.insert("category", WireValue::String("http".to_owned()));
            intrinsics.insert("component", WireValue::String(library.clone().into_owned()));
            intrinsics.insert("span.kind", WireValue::String("client".to_owned()));
        }
    }
}

fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    fn meta() -> TransactionMeta {
        TransactionMeta {
            trace_id: TraceId::from(0x1ee7_u128),
            guid: SegmentId::from(0xbeef_u64),
            sampled: true,
            priority: 0.5,
            noticed_error: None,
            route_params: Vec::new(),
        }
    }

    fn spawn(parent: &SegmentHandle, id: u64, name: &'static str) -> SegmentHandle {
        parent.spawn_child(
            SegmentId::from(id),
            Weak::new(),
            Cow::Borrowed(name),
            crate::time::now(),
        )
    }

    fn intrinsic<'a>(record: &'a SpanRecord, key: &str) -> &'a WireValue {
        record
            .intrinsics
            .get(key)
            .unwrap_or_else(|| panic!("missing intrinsic {key:?}"))
    }

    #[test]
    fn every_record_carries_the_required_intrinsics() {
        let root = SegmentHandle::detached("request");
        let child = spawn(&root, 2, "db.query");
        child.end();
        root.end();

        let meta = meta();
        let records = build_records(&root, &meta, crate::time::now(), None);
        assert_eq!(records.len(), 2);

        for record in &records {
            assert_eq!(record.trace_id, meta.trace_id.to_string());
            for key in [
                "type",
                "category",
                "guid",
                "parentId",
                "transactionId",
                "sampled",
                "priority",
                "name",
                "timestamp",
                "duration",
            ] {
                assert!(record.intrinsics.contains_key(key), "missing {key:?}");
            }
            assert_eq!(intrinsic(record, "type"), &WireValue::String("Span".to_owned()));
            assert_eq!(
                intrinsic(record, "transactionId"),
                &WireValue::String(meta.guid.to_string())
            );
            assert_eq!(intrinsic(record, "sampled"), &WireValue::Bool(true));
            assert_eq!(intrinsic(record, "priority"), &WireValue::Double(0.5));
        }

        // the root points at the transaction, children at their parent segment
        assert_eq!(
            intrinsic(&records[0], "parentId"),
            &WireValue::String(meta.guid.to_string())
        );
        assert_eq!(
            intrinsic(&records[1], "parentId"),
            &WireValue::String(root.id().to_string())
        );
    }

    #[test]
    fn name_override_applies_to_the_root_only() {
        let root = SegmentHandle::detached("request");
        let child = spawn(&root, 2, "db.query");
        child.end();
        root.end();

        let records = build_records(
            &root,
            &meta(),
            crate::time::now(),
            Some("WebTransaction/Handler/users".to_owned()),
        );
        assert_eq!(
            intrinsic(&records[0], "name"),
            &WireValue::String("WebTransaction/Handler/users".to_owned())
        );
        assert_eq!(
            intrinsic(&records[1], "name"),
            &WireValue::String("db.query".to_owned())
        );
    }

    #[test]
    fn datastore_and_external_segments_carry_component_and_kind() {
        let root = SegmentHandle::detached("request");
        let db = spawn(&root, 2, "db.users.find");
        db.set_category(Category::Datastore {
            product: "postgres".into(),
        });
        db.end();
        let http = spawn(&root, 3, "external.billing");
        http.set_category(Category::External {
            library: "reqwest".into(),
        });
        http.end();
        root.end();

        let records = build_records(&root, &meta(), crate::time::now(), None);

        assert_eq!(intrinsic(&records[0], "category"), &WireValue::String("generic".to_owned()));
        assert!(!records[0].intrinsics.contains_key("component"));
        assert!(!records[0].intrinsics.contains_key("span.kind"));

        assert_eq!(intrinsic(&records[1], "category"), &WireValue::String("datastore".to_owned()));
        assert_eq!(intrinsic(&records[1], "component"), &WireValue::String("postgres".to_owned()));
        assert_eq!(intrinsic(&records[1], "span.kind"), &WireValue::String("client".to_owned()));

        assert_eq!(intrinsic(&records[2], "category"), &WireValue::String("http".to_owned()));
        assert_eq!(intrinsic(&records[2], "component"), &WireValue::String("reqwest".to_owned()));
    }

    #[test]
    fn open_segments_are_exported_truncated_up_to_finalize_time() {
        let root = SegmentHandle::detached("request");
        let pending = spawn(&root, 2, "db.query");
        root.end();

        std::thread::sleep(Duration::from_millis(5));
        let finalize_time = crate::time::now();
        let records = build_records(&root, &meta(), finalize_time, None);

        assert_eq!(
            intrinsic(&records[1], "name"),
            &WireValue::String("Truncated/db.query".to_owned())
        );
        let expected = finalize_time
            .duration_since(pending.start_time())
            .unwrap()
            .as_secs_f64();
        match intrinsic(&records[1], "duration") {
            WireValue::Double(duration) => {
                assert!(*duration >= 0.0);
                assert!((duration - expected).abs() < 1e-9);
            }
            other => panic!("unexpected duration value {other:?}"),
        }
    }

    #[test]
    fn ignored_segments_drop_out_with_their_subtrees() {
        let root = SegmentHandle::detached("request");
        let timer = spawn(&root, 2, "timer");
        let nested = spawn(&timer, 3, "nested");
        nested.end();
        let sibling = spawn(&root, 4, "kept");
        sibling.end();
        timer.set_ignore(true);
        root.end();

        let records = build_records(&root, &meta(), crate::time::now(), None);
        let names: Vec<_> = records
            .iter()
            .map(|record| intrinsic(record, "name").clone())
            .collect();
        assert_eq!(
            names,
            vec![
                WireValue::String("request".to_owned()),
                WireValue::String("kept".to_owned()),
            ]
        );
    }

    #[test]
    fn opaque_segments_export_but_hide_descendants() {
        let root = SegmentHandle::detached("request");
        let opaque = spawn(&root, 2, "render");
        opaque.set_opaque(true);
        let hidden = spawn(&opaque, 3, "detail");
        hidden.end();
        opaque.end();
        root.end();

        let records = build_records(&root, &meta(), crate::time::now(), None);
        assert_eq!(records.len(), 2);
        assert_eq!(
            intrinsic(&records[1], "name"),
            &WireValue::String("render".to_owned())
        );
    }

    #[test]
    fn transaction_error_and_route_params_ride_on_the_root() {
        let root = SegmentHandle::detached("request");
        let child = spawn(&root, 2, "handler");
        child.end();
        root.end();

        let mut meta = meta();
        meta.noticed_error = Some(NoticedError {
            message: "boom".to_owned(),
            handled: false,
        });
        meta.route_params = vec![KeyValue::new("id", "42")];

        let records = build_records(&root, &meta, crate::time::now(), None);
        assert_eq!(
            records[0].agent_attributes.get("error.message"),
            Some(&WireValue::String("boom".to_owned()))
        );
        assert_eq!(
            records[0].agent_attributes.get("error.handled"),
            Some(&WireValue::Bool(false))
        );
        assert_eq!(
            records[0].agent_attributes.get("request.parameters.route.id"),
            Some(&WireValue::String("42".to_owned()))
        );
        assert!(records[1].agent_attributes.is_empty());
    }

    #[test]
    fn attributes_split_into_agent_and_user_maps() {
        let root = SegmentHandle::detached("request");
        root.add_attribute(KeyValue::new("db.statement", "SELECT 1"));
        root.add_attribute(KeyValue::new("port", 5432));
        root.add_custom_attribute(KeyValue::new("tenant", "acme"));
        root.end();

        let records = build_records(&root, &meta(), crate::time::now(), None);
        assert_eq!(
            records[0].agent_attributes.get("db.statement"),
            Some(&WireValue::String("SELECT 1".to_owned()))
        );
        assert_eq!(
            records[0].agent_attributes.get("port"),
            Some(&WireValue::Int(5432))
        );
        assert_eq!(
            records[0].user_attributes.get("tenant"),
            Some(&WireValue::String("acme".to_owned()))
        );
    }

    #[test]
    fn wire_values_serialize_with_kind_tags() {
        let json = |value: &WireValue| serde_json::to_value(value).unwrap();

        assert_eq!(
            json(&WireValue::String("x".to_owned())),
            serde_json::json!({ "string_value": "x" })
        );
        assert_eq!(json(&WireValue::Bool(true)), serde_json::json!({ "bool_value": true }));
        assert_eq!(json(&WireValue::Int(7)), serde_json::json!({ "int_value": 7 }));
        assert_eq!(
            json(&WireValue::Double(0.25)),
            serde_json::json!({ "double_value": 0.25 })
        );
    }

    #[test]
    fn record_serializes_to_the_wire_shape() {
        let root = SegmentHandle::detached("request");
        root.end();
        let records = build_records(&root, &meta(), crate::time::now(), None);

        let json = serde_json::to_value(&records[0]).unwrap();
        assert!(json.get("trace_id").is_some());
        assert!(json.get("intrinsics").is_some());
        assert!(json.get("user_attributes").is_some());
        assert!(json.get("agent_attributes").is_some());
        assert_eq!(
            json["intrinsics"]["type"],
            serde_json::json!({ "string_value": "Span" })
        );
    }
}
