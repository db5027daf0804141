//! Tests of the replica-to-replica contract: timestamps, enumeration and
//! the wire shape of deltas under an external serde codec.

use delta_crdts::{CausalTimestamp, Delta, OrSet, VersionRange, VersionRanges};

fn covers(newer: &CausalTimestamp<u8>, older: &CausalTimestamp<u8>) -> bool {
    older.iter().all(|(actor, ranges)| match newer.get(actor) {
        Some(current) => &current.intersect(ranges) == ranges,
        None => ranges.is_empty(),
    })
}

/// The intended anti-entropy flow from the engine's point of view: exchange
/// timestamps, stream the complement in both directions, merge.
#[test]
fn bidirectional_exchange_converges_in_one_round() {
    let a = OrSet::new();
    let b = OrSet::new();

    for member in 0..10u8 {
        a.insert(member, 1u8).unwrap();
    }
    for member in 5..15u8 {
        b.insert(member, 2u8).unwrap();
    }
    a.remove(&3);
    b.remove(&12);

    let a_time = a.timestamp();
    let b_time = b.timestamp();

    let to_b: Vec<_> = a.deltas_since(Some(&b_time)).collect();
    let to_a: Vec<_> = b.deltas_since(Some(&a_time)).collect();
    b.merge_all(to_b).unwrap();
    a.merge_all(to_a).unwrap();

    assert_eq!(a.values(), b.values());
    let expected: Vec<u8> = (0..15).filter(|m| *m != 3 && *m != 12).collect();
    assert_eq!(a.values(), expected);
}

#[test]
fn timestamps_only_ever_grow() {
    let a: OrSet<u8, u8> = OrSet::new();
    let b = OrSet::new();
    b.insert(9, 3u8).unwrap();
    let foreign: Vec<_> = b.deltas_since(None).collect();

    let mut previous = a.timestamp();
    let steps: Vec<Box<dyn Fn(&OrSet<u8, u8>)>> = vec![
        Box::new(|s| {
            s.insert(1, 1).unwrap();
        }),
        Box::new(|s| {
            s.insert(2, 1).unwrap();
        }),
        Box::new(|s| {
            s.remove(&1);
        }),
        Box::new(move |s| {
            s.merge_all(foreign.clone()).unwrap();
        }),
        Box::new(|s| {
            s.remove(&2);
            s.remove(&9);
        }),
    ];
    for step in steps {
        step(&a);
        let current = a.timestamp();
        assert!(covers(&current, &previous));
        previous = current;
    }
}

#[test]
fn timestamp_round_trips_through_serde() {
    let a = OrSet::new();
    for member in 0..4u8 {
        a.insert(member, 1u8).unwrap();
    }
    a.insert(0, 2u8).unwrap();
    a.remove(&2);

    let time = a.timestamp();
    let encoded = serde_json::to_string(&time).unwrap();
    let decoded: CausalTimestamp<u8> = serde_json::from_str(&encoded).unwrap();
    assert_eq!(time, decoded);

    // the wire shape is {actor: [{start, end}, ...]}
    let expected: VersionRanges = vec![VersionRange::new(1, 5)].into_iter().collect();
    assert_eq!(decoded.get(&1), Some(&expected));
}

#[test]
fn deltas_round_trip_through_serde() {
    let a = OrSet::new();
    a.insert("carrots".to_string(), 1u8).unwrap();
    a.insert("beets".to_string(), 1u8).unwrap();
    a.insert("beets".to_string(), 2u8).unwrap();
    a.remove(&"carrots".to_string());

    let outbound: Vec<Delta<u8, String>> = a.deltas_since(None).collect();
    let encoded = serde_json::to_string(&outbound).unwrap();
    let deltas: Vec<Delta<u8, String>> = serde_json::from_str(&encoded).unwrap();
    assert_eq!(outbound, deltas);

    let fresh = OrSet::new();
    fresh.merge_all(deltas).unwrap();
    assert_eq!(fresh.values(), vec!["beets".to_string()]);
}

#[test]
fn removal_ranges_cross_the_wire_compressed() {
    let a = OrSet::new();
    for member in 0..20u8 {
        a.insert(member, 1u8).unwrap();
    }
    let full = a.timestamp();
    for member in 0..19u8 {
        a.remove(&member);
    }

    let deltas: Vec<Delta<u8, u8>> = a.deltas_since(Some(&full)).collect();
    assert_eq!(
        deltas,
        vec![Delta::RemovedRange {
            actor: 1,
            range: VersionRange::new(1, 20)
        }]
    );

    let encoded = serde_json::to_string(&deltas).unwrap();
    let decoded: Vec<Delta<u8, u8>> = serde_json::from_str(&encoded).unwrap();
    assert_eq!(deltas, decoded);

    let b = OrSet::new();
    b.merge_all(a.deltas_since(None).collect::<Vec<_>>()).unwrap();
    b.merge_all(decoded).unwrap();
    assert_eq!(b.values(), vec![19]);
}
