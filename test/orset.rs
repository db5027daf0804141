use delta_crdts::{Delta, OrSet};

const REPLICA_MAX: u8 = 8;

/// Apply each op at the replica its actor lives on. Actors are pinned to one
/// replica so no actor identity ever writes through two engines.
fn apply_ops(replicas: &[OrSet<u8, u8>], ops: &[(u8, u8, bool)]) {
    let n = replicas.len() as u8;
    for (actor, member, is_add) in ops.iter() {
        let replica = &replicas[(actor % n) as usize];
        if *is_add {
            replica.insert(*member, *actor).unwrap();
        } else {
            replica.remove(member);
        }
    }
}

/// Pairwise delta exchange until a full round teaches nobody anything.
fn sync_to_fixpoint(replicas: &[OrSet<u8, u8>]) {
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

/// Present dots, as comparable tuples. Converged replicas agree on these,
/// not just on the member list.
fn present_dots(set: &OrSet<u8, u8>) -> Vec<(u8, u8, u64)> {
    let mut dots: Vec<_> = set
        .deltas_since(None)
        .map(|delta| match delta {
            Delta::Added {
                item,
                actor,
                version,
            } => (item, actor, version),
            other => panic!("a fresh peer only needs additions, got {:?}", other),
        })
        .collect();
    dots.sort();
    dots
}

quickcheck! {
    fn prop_replicas_converge(ops: Vec<(u8, u8, bool)>) -> bool {
        // apply the same op stream over growing replica groups; every group
        // must agree with itself after syncing to fixpoint
        for n in 2..REPLICA_MAX {
            let replicas: Vec<OrSet<u8, u8>> = (0..n).map(|_| OrSet::new()).collect();
            apply_ops(&replicas, &ops);
            sync_to_fixpoint(&replicas);

            let reference = replicas[0].values();
            let reference_dots = present_dots(&replicas[0]);
            for replica in replicas.iter().skip(1) {
                if replica.values() != reference {
                    return false;
                }
                if present_dots(replica) != reference_dots {
                    return false;
                }
            }
        }
        true
    }

    fn prop_merging_a_batch_twice_changes_nothing(ops: Vec<(u8, u8, bool)>) -> bool {
        let source = OrSet::new();
        apply_ops(std::slice::from_ref(&source), &ops);
        let deltas: Vec<_> = source.deltas_since(None).collect();

        let replica = OrSet::new();
        replica.merge_all(deltas.clone()).unwrap();
        let once = replica.values();

        // the second delivery is a no-op, delta by delta
        for delta in deltas {
            if replica.merge(delta).unwrap().updated() {
                return false;
            }
        }
        replica.values() == once
    }

    fn prop_delivery_order_does_not_matter(ops: Vec<(u8, u8, bool)>) -> bool {
        let source = OrSet::new();
        apply_ops(std::slice::from_ref(&source), &ops);
        let deltas: Vec<_> = source.deltas_since(None).collect();

        let forward = OrSet::new();
        forward.merge_all(deltas.clone()).unwrap();

        let backward = OrSet::new();
        backward.merge_all(deltas.into_iter().rev()).unwrap();

        forward.values() == backward.values()
            && present_dots(&forward) == present_dots(&backward)
    }

    fn prop_fresh_replica_reaches_source_value(ops: Vec<(u8, u8, bool)>) -> bool {
        let source = OrSet::new();
        apply_ops(std::slice::from_ref(&source), &ops);

        let replica = OrSet::new();
        let everything: Vec<_> = source.deltas_since(None).collect();
        replica.merge_all(everything).unwrap();
        replica.values() == source.values()
    }
}

/// A removal raced by a re-add of the same member must lose on every
/// replica, whichever arrives first.
#[test]
fn readd_wins_over_inflight_removal_everywhere() {
    let a = OrSet::new();
    let b = OrSet::new();

    let first = a.insert(0u8, 1u8).unwrap();
    b.merge(first).unwrap();

    let removal = b.remove(&0);
    let second = a.insert(0, 1).unwrap();

    a.merge_all(removal.clone()).unwrap();
    b.merge(second.clone()).unwrap();

    assert_eq!(a.values(), vec![0]);
    assert_eq!(b.values(), vec![0]);

    let c = OrSet::new();
    c.merge(second).unwrap();
    c.merge_all(removal).unwrap();
    assert_eq!(c.values(), vec![0]);
}

/// Dropping a delta and retrying later is healed by the enumeration
/// protocol: whatever was missed is recomputed from state.
#[test]
fn dropped_deltas_are_recovered_on_the_next_exchange() {
    let a = OrSet::new();
    let b = OrSet::new();

    let kept = a.insert(1u8, 1u8).unwrap();
    let _lost_in_transit = a.insert(2, 1).unwrap();
    b.merge(kept).unwrap();
    assert_eq!(b.values(), vec![1]);

    // next anti-entropy round recovers the dropped dot
    let missing: Vec<_> = a.deltas_since(Some(&b.timestamp())).collect();
    b.merge_all(missing).unwrap();
    assert_eq!(b.values(), vec![1, 2]);
}
