//! Cursor walks over real on-disk partitions: filters, delta
//! materialization, segment rolling and retention.

use std::sync::Arc;

use bytes::Bytes;
use tempfile::tempdir;

use streamgate_cache::{
    CacheConfig, Cursor, FilterCondition, Partition, PartitionWriter,
};
use streamgate_core::types::{
    KafkaCondition, KafkaDeltaType, KafkaFilter, KafkaHeader, KafkaKey, KafkaValueMatch,
};

struct Fixture {
    _dir: tempfile::TempDir,
    partition: Arc<Partition>,
    writer: PartitionWriter,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let partition = Partition::new(dir.path().join("t-0"), CacheConfig::small()).unwrap();
    let writer = PartitionWriter::new(Arc::clone(&partition), CacheConfig::small(), 0);
    Fixture {
        _dir: dir,
        partition,
        writer,
    }
}

fn append(
    fixture: &mut Fixture,
    key: Option<&str>,
    headers: &[(&str, &str)],
    value: Option<&str>,
) -> i64 {
    append_delta(fixture, key, headers, value, None)
}

fn append_delta(
    fixture: &mut Fixture,
    key: Option<&str>,
    headers: &[(&str, &str)],
    value: Option<&str>,
    delta: Option<&[u8]>,
) -> i64 {
    let key = match key {
        Some(k) => KafkaKey::of(k.to_string()),
        None => KafkaKey::null(),
    };
    let headers = headers
        .iter()
        .map(|(n, v)| KafkaHeader::new(n.to_string(), v.to_string()))
        .collect();
    fixture
        .writer
        .append(
            key,
            headers,
            value.map(|v| Bytes::from(v.to_string())),
            0,
            delta.map(Bytes::copy_from_slice),
        )
        .unwrap()
}

fn collect(fixture: &Fixture, filters: &[KafkaFilter], from: i64) -> Vec<i64> {
    collect_entries(fixture, filters, from, KafkaDeltaType::None)
        .into_iter()
        .map(|e| e.offset)
        .collect()
}

fn collect_entries(
    fixture: &Fixture,
    filters: &[KafkaFilter],
    from: i64,
    delta_type: KafkaDeltaType,
) -> Vec<streamgate_cache::CacheEntry> {
    let mut cursor = Cursor::new(FilterCondition::from_filters(filters), delta_type);
    cursor.init(fixture.partition.node_at(from), from, -1);
    let mut entries = Vec::new();
    while let Some(entry) = cursor.next() {
        cursor.advance(entry.offset + 1);
        entries.push(entry);
    }
    entries
}

fn key_filter(key: &str) -> KafkaFilter {
    KafkaFilter::new(vec![KafkaCondition::Key(KafkaKey::of(key.to_string()))])
}

#[test]
fn unfiltered_cursor_delivers_everything() {
    let mut fx = fixture();
    for i in 0..5 {
        append(&mut fx, Some("k"), &[], Some(&format!("v{i}")));
    }
    assert_eq!(collect(&fx, &[], 0), vec![0, 1, 2, 3, 4]);
}

#[test]
fn key_and_header_conjunction() {
    // Records: (0,"a",{x:1}), (1,"a",{x:2}), (2,"b",{x:1}); only the
    // first satisfies AND(KEY("a"), HEADER("x","1")).
    let mut fx = fixture();
    append(&mut fx, Some("a"), &[("x", "1")], Some("v"));
    append(&mut fx, Some("a"), &[("x", "2")], Some("v"));
    append(&mut fx, Some("b"), &[("x", "1")], Some("v"));

    let filter = KafkaFilter::new(vec![
        KafkaCondition::Key(KafkaKey::of("a")),
        KafkaCondition::Header(KafkaHeader::new("x", "1")),
    ]);
    assert_eq!(collect(&fx, &[filter], 0), vec![0]);
}

#[test]
fn not_key_excludes_matches() {
    let mut fx = fixture();
    append(&mut fx, Some("a"), &[("x", "1")], Some("v"));
    append(&mut fx, Some("a"), &[("x", "2")], Some("v"));
    append(&mut fx, Some("b"), &[("x", "1")], Some("v"));

    let filter = KafkaFilter::new(vec![KafkaCondition::Not(Box::new(KafkaCondition::Key(
        KafkaKey::of("a"),
    )))]);
    assert_eq!(collect(&fx, &[filter], 0), vec![2]);
}

#[test]
fn filter_list_is_a_disjunction() {
    let mut fx = fixture();
    append(&mut fx, Some("a"), &[], Some("v"));
    append(&mut fx, Some("b"), &[], Some("v"));
    append(&mut fx, Some("c"), &[], Some("v"));

    let filters = vec![key_filter("a"), key_filter("c")];
    assert_eq!(collect(&fx, &filters, 0), vec![0, 2]);
}

#[test]
fn filtered_walk_across_sealed_segments() {
    let mut fx = fixture();
    let mut expected = Vec::new();
    for i in 0..30 {
        let key = if i % 3 == 0 { "wanted" } else { "other" };
        let padding = "x".repeat(120);
        let offset = append(&mut fx, Some(key), &[], Some(&padding));
        if i % 3 == 0 {
            expected.push(offset);
        }
    }
    fx.writer.seal_active();

    assert_eq!(collect(&fx, &[key_filter("wanted")], 0), expected);
}

#[test]
fn header_sequence_with_skip() {
    let mut fx = fixture();
    // Matches: v1, one same-name header, v2 and nothing after.
    append(&mut fx, None, &[("h", "v1"), ("h", "mid"), ("h", "v2")], Some("m"));
    // No same-name header between v1 and v2: the skip has nothing to eat.
    append(&mut fx, None, &[("h", "v1"), ("h", "v2")], Some("n"));
    // Other-name headers are transparent.
    append(
        &mut fx,
        None,
        &[("o", "x"), ("h", "v1"), ("h", "mid"), ("o", "y"), ("h", "v2")],
        Some("m"),
    );
    // Trailing same-name header after the template completes.
    append(
        &mut fx,
        None,
        &[("h", "v1"), ("h", "mid"), ("h", "v2"), ("h", "tail")],
        Some("n"),
    );

    let filter = KafkaFilter::new(vec![KafkaCondition::Headers {
        name: Bytes::from_static(b"h"),
        matches: vec![
            KafkaValueMatch::Value(Bytes::from_static(b"v1")),
            KafkaValueMatch::Skip,
            KafkaValueMatch::Value(Bytes::from_static(b"v2")),
        ],
    }]);
    assert_eq!(collect(&fx, &[filter], 0), vec![0, 2]);
}

#[test]
fn delta_materialized_when_ancestor_in_horizon() {
    // Offsets 0..4 are unrelated traffic; offset 5 is the full record,
    // offset 9 carries a patch against it.
    let mut fx = fixture();
    for i in 0..5 {
        append(&mut fx, Some(&format!("other{i}")), &[], Some("o"));
    }
    append(&mut fx, Some("k"), &[], Some(r#"{"n":1}"#));
    for i in 0..3 {
        append(&mut fx, Some(&format!("more{i}")), &[], Some("o"));
    }
    let patch = serde_json::json!([{"op": "replace", "path": "/n", "value": 2}]);
    let patch_bytes = serde_json::to_vec(&patch).unwrap();
    let ninth = append_delta(
        &mut fx,
        Some("k"),
        &[],
        Some(r#"{"n":2}"#),
        Some(&patch_bytes),
    );
    assert_eq!(ninth, 9);

    let entries = collect_entries(&fx, &[key_filter("k")], 0, KafkaDeltaType::JsonPatch);
    assert_eq!(entries.len(), 2);

    assert_eq!(entries[0].offset, 5);
    assert_eq!(entries[0].ancestor, -1);
    assert_eq!(entries[0].value.as_deref(), Some(br#"{"n":1}"#.as_slice()));

    // Ancestor was seen at offset 5, so offset 9 ships as a patch.
    assert_eq!(entries[1].offset, 9);
    assert_eq!(entries[1].ancestor, 5);
    assert_eq!(entries[1].value.as_deref(), Some(patch_bytes.as_slice()));
}

#[test]
fn delta_collapsed_when_ancestor_outside_horizon() {
    let mut fx = fixture();
    for i in 0..5 {
        append(&mut fx, Some(&format!("other{i}")), &[], Some("o"));
    }
    append(&mut fx, Some("k"), &[], Some(r#"{"n":1}"#));
    for i in 0..3 {
        append(&mut fx, Some(&format!("more{i}")), &[], Some("o"));
    }
    let patch = br#"[{"op":"replace","path":"/n","value":2}]"#;
    append_delta(&mut fx, Some("k"), &[], Some(r#"{"n":2}"#), Some(patch));

    // Subscribing at offset 8 never sees the ancestor at 5.
    let entries = collect_entries(&fx, &[key_filter("k")], 8, KafkaDeltaType::JsonPatch);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].offset, 9);
    assert_eq!(entries[0].ancestor, -1);
    assert_eq!(entries[0].value.as_deref(), Some(br#"{"n":2}"#.as_slice()));
}

#[test]
fn tombstone_keeps_ancestor_and_clears_horizon() {
    let mut fx = fixture();
    append(&mut fx, Some("k"), &[], Some("v1"));
    append(&mut fx, Some("k"), &[], None);
    let patch = b"patch";
    append_delta(&mut fx, Some("k"), &[], Some("v3"), Some(patch));

    let entries = collect_entries(&fx, &[key_filter("k")], 0, KafkaDeltaType::JsonPatch);
    assert_eq!(entries.len(), 3);

    // Tombstone is delivered verbatim with its original ancestor.
    assert!(entries[1].is_tombstone());
    assert_eq!(entries[1].ancestor, 0);

    // The record after the tombstone has no ancestor lineage.
    assert_eq!(entries[2].ancestor, -1);
    assert_eq!(entries[2].value.as_deref(), Some(b"v3".as_slice()));
}

#[test]
fn delta_mode_none_leaves_entries_untouched() {
    let mut fx = fixture();
    append(&mut fx, Some("k"), &[], Some(r#"{"n":1}"#));
    append_delta(&mut fx, Some("k"), &[], Some(r#"{"n":2}"#), Some(b"patch"));

    let entries = collect_entries(&fx, &[], 0, KafkaDeltaType::None);
    assert_eq!(entries[1].ancestor, 0);
    assert_eq!(entries[1].value.as_deref(), Some(br#"{"n":2}"#.as_slice()));
}

#[test]
fn resume_from_reported_offset_has_no_gap_or_duplicate() {
    let mut fx = fixture();
    for i in 0..10 {
        append(&mut fx, Some("k"), &[], Some(&format!("v{i}")));
    }

    let first_half = {
        let mut cursor = Cursor::new(FilterCondition::from_filters(&[]), KafkaDeltaType::None);
        cursor.init(fx.partition.node_at(0), 0, -1);
        let mut seen = Vec::new();
        for _ in 0..5 {
            let entry = cursor.next().unwrap();
            cursor.advance(entry.offset + 1);
            seen.push(entry.offset);
        }
        seen
    };
    assert_eq!(first_half, vec![0, 1, 2, 3, 4]);

    // A fresh cursor rooted at last + 1 resumes exactly.
    let resume_at = first_half.last().unwrap() + 1;
    assert_eq!(collect(&fx, &[], resume_at), vec![5, 6, 7, 8, 9]);
}

#[test]
fn retention_retires_old_segments_for_parked_cursor() {
    let mut fx = fixture();
    let value = "x".repeat(200);
    for _ in 0..12 {
        append(&mut fx, Some("k"), &[], Some(&value));
    }

    fx.partition.retain_from(8);
    let base = fx.partition.base_offset();
    assert!(base > 0);

    let offsets = collect(&fx, &[], 0);
    assert_eq!(offsets.first().copied(), Some(base));
    assert_eq!(offsets.last().copied(), Some(11));
}
