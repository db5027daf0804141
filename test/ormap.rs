use delta_crdts::{GrowSet, OrMap};

type TestMap = OrMap<u8, GrowSet<u8>, u8>;

/// Apply each op at the replica its actor lives on.
fn apply_ops(replicas: &[TestMap], ops: &[(u8, u8, u8, bool)]) {
    let n = replicas.len() as u8;
    for (actor, key, element, is_update) in ops.iter() {
        let replica = &replicas[(actor % n) as usize];
        if *is_update {
            replica
                .update(*key, *actor, |_| vec![*element])
                .unwrap();
        } else {
            replica.remove(key);
        }
    }
}

fn sync_to_fixpoint(replicas: &[TestMap]) {
    loop {
        let mut changed = false;
        for (i, dst) in replicas.iter().enumerate() {
            for (j, src) in replicas.iter().enumerate() {
                if i == j {
                    continue;
                }
                let known = dst.timestamp();
                let missing: Vec<_> = src.deltas_since(Some(&known)).collect();
                if dst.merge_all(missing).unwrap().updated() {
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }
    }
}

/// The whole observable state: every key with its merged elements.
fn contents(map: &TestMap) -> Vec<(u8, Vec<u8>)> {
    map.keys()
        .into_iter()
        .map(|key| {
            let value = map.get(&key).expect("listed key is present");
            (key, value.iter().cloned().collect())
        })
        .collect()
}

quickcheck! {
    fn prop_map_replicas_converge(ops: Vec<(u8, u8, u8, bool)>) -> bool {
        for n in 2..5u8 {
            let replicas: Vec<TestMap> = (0..n).map(|_| OrMap::new()).collect();
            apply_ops(&replicas, &ops);
            sync_to_fixpoint(&replicas);

            let reference = contents(&replicas[0]);
            for replica in replicas.iter().skip(1) {
                if contents(replica) != reference {
                    return false;
                }
            }
        }
        true
    }

    fn prop_fresh_map_reaches_source_contents(ops: Vec<(u8, u8, u8, bool)>) -> bool {
        let source = TestMap::new();
        apply_ops(std::slice::from_ref(&source), &ops);

        let replica = TestMap::new();
        let everything: Vec<_> = source.deltas_since(None).collect();
        replica.merge_all(everything).unwrap();
        contents(&replica) == contents(&source)
    }

    fn prop_map_delivery_order_does_not_matter(ops: Vec<(u8, u8, u8, bool)>) -> bool {
        let source = TestMap::new();
        apply_ops(std::slice::from_ref(&source), &ops);
        let deltas: Vec<_> = source.deltas_since(None).collect();

        let forward = TestMap::new();
        forward.merge_all(deltas.clone()).unwrap();

        let backward = TestMap::new();
        backward.merge_all(deltas.into_iter().rev()).unwrap();

        contents(&forward) == contents(&backward)
    }
}

/// The signature nested-CRDT behavior: a concurrent edit keeps the key
/// alive through a remove, holding only the edits the remover never saw.
#[test]
fn concurrent_edit_survives_remove_with_reset_semantics() {
    let m1 = TestMap::new();
    let seed = m1.update(7, 1, |_| vec![10]).unwrap();

    let m2 = TestMap::new();
    m2.merge(seed).unwrap();

    let removal = m1.remove(&7);
    let concurrent = m2.update(7, 2, |_| vec![20]).unwrap();

    m1.merge(concurrent).unwrap();
    m2.merge_all(removal).unwrap();

    assert_eq!(contents(&m1), contents(&m2));
    let value = m1.get(&7).expect("key survives the concurrent edit");
    assert!(!value.contains(&10));
    assert!(value.contains(&20));
}
