// tests/property/aggregate_test.rs

//! Property-based tests for counter aggregation and pixel coalescing

use parking_lot::Mutex;
use pixelcast::core::broker::cluster::ShardRegistry;
use pixelcast::core::broker::{EventBroker, LocalBroker};
use pixelcast::core::events::{BrokerEvent, EventKind};
use pixelcast::core::pixel_cache::PixelCache;
use pixelcast::core::protocol::pixel::MAX_OFFSET;
use pixelcast::core::protocol::{ChunkRef, OnlineCounter, PixelRecord, PixelUpdate};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn counter_strategy() -> impl Strategy<Value = OnlineCounter> {
    (
        0u32..10_000,
        prop::collection::btree_map(0u8..8, 0u32..10_000, 0..8),
    )
        .prop_map(|(total, canvases)| OnlineCounter { total, canvases })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_counter_sum_ignores_order(counters in prop::collection::vec(counter_strategy(), 0..10)) {
        let forward = OnlineCounter::sum(counters.iter());
        let backward = OnlineCounter::sum(counters.iter().rev());
        prop_assert_eq!(&forward, &backward);
        prop_assert_eq!(forward.total, counters.iter().map(|c| c.total).sum::<u32>());
    }

    #[test]
    fn test_registry_aggregate_is_sum_of_snapshots(
        mine in counter_strategy(),
        others in prop::collection::vec(counter_strategy(), 0..6)
    ) {
        let mut registry = ShardRegistry::new("a");
        registry.update_counter("a", mine.clone());
        for (n, counter) in others.iter().enumerate() {
            let shard = format!("s{n}");
            registry.observe(&shard, 1_000);
            registry.update_counter(&shard, counter.clone());
        }
        let expected = OnlineCounter::sum(std::iter::once(&mine).chain(others.iter()));
        prop_assert_eq!(registry.aggregate(), expected);

        // Everyone falls silent; only this shard's snapshot is left.
        registry.evict_stale(100_000, 30_000);
        prop_assert!(registry.is_empty());
        prop_assert_eq!(registry.aggregate(), OnlineCounter::sum([&mine]));
    }

    #[test]
    fn test_flush_preserves_per_chunk_order(
        writes in prop::collection::vec(
            (0u8..3, 0u8..4, 0u8..4, 0..=MAX_OFFSET, any::<u8>()),
            1..300
        )
    ) {
        let broker = LocalBroker::new("shard");
        let seen: Arc<Mutex<HashMap<(u8, ChunkRef), Vec<PixelRecord>>>> = Default::default();
        let sink = seen.clone();
        broker.on(
            EventKind::PixelUpdate,
            Arc::new(move |event: &BrokerEvent| {
                if let BrokerEvent::PixelUpdate { canvas_id, packet, .. } = event {
                    let update = PixelUpdate::hydrate(packet).unwrap();
                    let previous = sink.lock().insert((*canvas_id, update.chunk), update.pixels);
                    assert!(previous.is_none(), "chunk flushed twice");
                }
            }),
        );

        let cache = PixelCache::new();
        let mut expected: HashMap<(u8, ChunkRef), Vec<PixelRecord>> = HashMap::new();
        for &(canvas_id, i, j, offset, color) in &writes {
            cache.append(canvas_id, color, i, j, offset);
            expected
                .entry((canvas_id, ChunkRef::new(i, j)))
                .or_default()
                .push(PixelRecord::new(offset, color));
        }

        prop_assert_eq!(cache.flush(&broker), expected.len());
        prop_assert!(cache.is_empty());
        prop_assert_eq!(&*seen.lock(), &expected);
    }
}
