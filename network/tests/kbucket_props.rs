use proptest::prelude::*;

use meridian_network::kbucket::RouteTable;
use meridian_types::{common_prefix_len, PeerId};

fn canonical() -> impl Strategy<Value = PeerId> {
    prop::array::uniform20(any::<u8>()).prop_map(PeerId::Canonical)
}

fn addr(i: usize) -> String {
    format!("10.0.{}.{}:20338", i / 256, i % 256)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Buckets never overflow and only hold peers of their prefix length.
    #[test]
    fn buckets_respect_size_and_prefix(
        local in canonical(),
        ids in prop::collection::hash_set(canonical(), 1..120),
    ) {
        let mut table = RouteTable::new(4, local);
        let mut admitted = 0;
        for (i, id) in ids.iter().enumerate() {
            if *id == local {
                continue;
            }
            if table.update(*id, addr(i)).is_ok() {
                admitted += 1;
                prop_assert!(table.find(id).is_some());
            } else {
                prop_assert!(table.find(id).is_none());
            }
        }
        prop_assert_eq!(table.size(), admitted);

        let last = table.buckets().len() - 1;
        for (i, bucket) in table.buckets().iter().enumerate() {
            prop_assert!(bucket.len() <= 4);
            for pair in bucket.peers() {
                let cpl = common_prefix_len(&pair.id, &local);
                if i == last {
                    prop_assert!(cpl >= i);
                } else {
                    prop_assert_eq!(cpl, i);
                }
            }
        }
    }

    /// Lookups come back nearest first and as large as the table allows.
    #[test]
    fn nearest_peers_sorted_and_bounded(
        local in canonical(),
        ids in prop::collection::hash_set(canonical(), 0..60),
        target in canonical(),
        count in 1usize..30,
        bucket_size in 1usize..20,
    ) {
        let mut table = RouteTable::new(bucket_size, local);
        for (i, id) in ids.iter().enumerate() {
            let _ = table.update(*id, addr(i));
        }

        let found = table.nearest_peers(&target, count);
        prop_assert_eq!(found.len(), count.min(table.size()));
        for pair in found.windows(2) {
            prop_assert!(target.distance(&pair[0].id) <= target.distance(&pair[1].id));
        }

        let mut all = table.list_peers();
        all.sort_by_key(|p| target.distance(&p.id));
        let expected: Vec<_> = all.iter().take(count).map(|p| target.distance(&p.id)).collect();
        let got: Vec<_> = found.iter().map(|p| target.distance(&p.id)).collect();
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn removed_peers_are_gone(local in canonical(), ids in prop::collection::hash_set(canonical(), 1..40)) {
        let mut table = RouteTable::new(20, local);
        for (i, id) in ids.iter().enumerate() {
            let _ = table.update(*id, addr(i));
        }
        for id in &ids {
            table.remove(id);
            prop_assert!(table.find(id).is_none());
        }
        prop_assert_eq!(table.size(), 0);
    }
}
