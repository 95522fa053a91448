use proptest::prelude::*;
use serde_json::{Value, json};

use inline_markers::{Extraction, Marker, MarkerInterceptor, extract_all};

/// Split `text` at the given byte positions (snapped down to char boundaries).
fn split_at_points(text: &str, mut points: Vec<usize>) -> Vec<&str> {
    points.retain(|p| *p < text.len());
    for p in points.iter_mut() {
        while !text.is_char_boundary(*p) {
            *p -= 1;
        }
    }
    points.sort_unstable();
    points.dedup();

    let mut chunks = Vec::new();
    let mut last = 0;
    for p in points {
        chunks.push(&text[last..p]);
        last = p;
    }
    chunks.push(&text[last..]);
    chunks
}

fn run_chunks(chunks: &[&str]) -> Extraction {
    let mut interceptor = MarkerInterceptor::new();
    let mut pooled = Extraction::default();
    for chunk in chunks {
        pooled.append(interceptor.add_chunk(chunk));
    }
    pooled.append(interceptor.flush());
    pooled
}

// --- Arbitrary JSON ---

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z{}\\[\\]\" \\\\:,]{0,8}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,5}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,5}", arb_json(), 0..4)
        .prop_map(|m| Value::Object(m.into_iter().collect()))
}

/// Prose that never contains a marker literal (may contain lone brackets).
fn arb_prose() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,!?\\[\\]{}:\"é✓\n]{0,40}".prop_filter("no marker literal", |s| {
        !s.contains("[DASHBOARD:") && !s.contains("[RENDER:")
    })
}

fn arb_marker_literal() -> impl Strategy<Value = String> {
    prop_oneof![
        ("[a-z]{1,8}", prop::option::of(arb_json())).prop_map(|(intent, data)| {
            let mut body = json!({ "intent": intent });
            if let Some(d) = data {
                body["data"] = d;
            }
            format!("[DASHBOARD:{}]", body)
        }),
        ("[a-zA-Z]{1,8}", arb_json())
            .prop_map(|(component, props)| format!("[RENDER:{}:{}]", component, props)),
        Just("[DASHBOARD:{not json}]".to_string()),
        Just("[RENDER:broken".to_string()),
        Just("[DASHBOARD:".to_string()),
    ]
}

fn arb_message() -> impl Strategy<Value = String> {
    prop::collection::vec((arb_prose(), arb_marker_literal()), 0..4).prop_flat_map(|parts| {
        arb_prose().prop_map(move |tail| {
            let mut s = String::new();
            for (prose, marker) in &parts {
                s.push_str(prose);
                s.push_str(marker);
            }
            s.push_str(&tail);
            s
        })
    })
}

proptest! {
    #[test]
    fn marker_free_text_is_reproduced(
        text in arb_prose(),
        points in prop::collection::vec(0usize..64, 0..8),
    ) {
        let chunks = split_at_points(&text, points);
        let out = run_chunks(&chunks);
        prop_assert!(out.markers.is_empty());
        prop_assert_eq!(out.text, text);
    }

    #[test]
    fn dashboard_with_any_object_data(data in arb_object()) {
        let literal = format!("[DASHBOARD:{}]", json!({ "intent": "x", "data": data.clone() }));
        let mut interceptor = MarkerInterceptor::new();
        let out = interceptor.add_chunk(&literal);
        prop_assert_eq!(out.text, "");
        prop_assert_eq!(
            out.markers,
            vec![Marker::Dashboard { intent: "x".into(), data: Some(data) }]
        );
    }

    #[test]
    fn split_invariance(
        message in arb_message(),
        points in prop::collection::vec(0usize..256, 0..12),
    ) {
        let whole = extract_all(&message);
        let chunks = split_at_points(&message, points);
        let pooled = run_chunks(&chunks);
        prop_assert_eq!(pooled.text, whole.text);
        prop_assert_eq!(pooled.markers, whole.markers);
    }

    #[test]
    fn byte_by_byte_matches_whole(message in arb_message()) {
        let whole = extract_all(&message);
        let chars: Vec<String> = message.chars().map(|c| c.to_string()).collect();
        let chunks: Vec<&str> = chars.iter().map(String::as_str).collect();
        let pooled = run_chunks(&chunks);
        prop_assert_eq!(pooled.text, whole.text);
        prop_assert_eq!(pooled.markers, whole.markers);
    }

    #[test]
    fn confirmed_marker_leaves_only_prose(
        prose in arb_prose(),
        intent in "[a-z]{1,8}",
    ) {
        let message = format!("{prose}[DASHBOARD:{}]{prose}", json!({ "intent": intent }));
        let out = extract_all(&message);
        prop_assert_eq!(out.markers.len(), 1);
        prop_assert_eq!(out.text, format!("{prose}{prose}"));
    }
}
