// tests/property/codec_test.rs

//! Property-based tests for the wire codecs
//! Tests that packets decode to what was encoded, whatever the contents

use bytes::{Bytes, BytesMut};
use pixelcast::core::broker::cluster::GossipFrame;
use pixelcast::core::events::BrokerEvent;
use pixelcast::core::protocol::chunk::{cache_key, split_cache_key};
use pixelcast::core::protocol::pixel::{MAX_OFFSET, encode_records};
use pixelcast::core::protocol::{
    ChunkRef, OnlineCounter, PixelRecord, PixelUpdate, RespFrame, RespFrameCodec,
    ShardPixelUpdate,
};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

fn pixel_strategy() -> impl Strategy<Value = PixelRecord> {
    (0..=MAX_OFFSET, any::<u8>()).prop_map(|(offset, color)| PixelRecord::new(offset, color))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 1000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_pixel_update_roundtrip(
        i in any::<u8>(),
        j in any::<u8>(),
        pixels in prop::collection::vec(pixel_strategy(), 0..600)
    ) {
        let update = PixelUpdate::new(ChunkRef::new(i, j), pixels);
        let decoded = PixelUpdate::hydrate(&update.dehydrate()).unwrap();
        prop_assert_eq!(decoded, update);
    }

    #[test]
    fn test_client_requests_are_capped(
        pixels in prop::collection::vec(pixel_strategy(), 0..800)
    ) {
        let update = PixelUpdate::new(ChunkRef::new(1, 2), pixels.clone());
        let decoded = PixelUpdate::hydrate_request(&update.dehydrate()).unwrap();
        let kept = pixels.len().min(500);
        prop_assert_eq!(&decoded.pixels[..], &pixels[..kept]);
    }

    #[test]
    fn test_shard_packet_matches_client_packet(
        canvas_id in any::<u8>(),
        i in any::<u8>(),
        j in any::<u8>(),
        pixels in prop::collection::vec(pixel_strategy(), 0..100)
    ) {
        let chunk = ChunkRef::new(i, j);
        let packed = encode_records(&pixels);
        let shard = ShardPixelUpdate::hydrate(&ShardPixelUpdate::dehydrate(canvas_id, chunk, &packed)).unwrap();
        prop_assert_eq!(shard.canvas_id, canvas_id);
        prop_assert_eq!(shard.chunk, chunk);
        prop_assert_eq!(shard.pixels(), pixels.clone());
        prop_assert_eq!(shard.client_packet(), PixelUpdate::new(chunk, pixels).dehydrate());
    }

    #[test]
    fn test_chunk_and_cache_keys_roundtrip(canvas_id in any::<u8>(), i in any::<u8>(), j in any::<u8>()) {
        let chunk = ChunkRef::new(i, j);
        prop_assert_eq!(ChunkRef::from_key(chunk.key()), chunk);
        prop_assert_eq!(split_cache_key(cache_key(canvas_id, chunk)), (canvas_id, chunk));
    }

    #[test]
    fn test_online_counter_roundtrip_within_u16(
        total in 0u32..=u16::MAX as u32,
        canvases in prop::collection::btree_map(any::<u8>(), 0u32..=u16::MAX as u32, 0..20)
    ) {
        let counter = OnlineCounter { total, canvases };
        prop_assert_eq!(OnlineCounter::hydrate(&counter.dehydrate()).unwrap(), counter);
    }

    #[test]
    fn test_online_counter_saturates(total in (u16::MAX as u32 + 1)..u32::MAX) {
        let decoded = OnlineCounter::hydrate(&OnlineCounter::new(total).dehydrate()).unwrap();
        prop_assert_eq!(decoded.total, u16::MAX as u32);
    }

    #[test]
    fn test_gossip_relay_roundtrip(
        shard in "[0-9a-f]{1,40}",
        kind in "[a-zA-Z]{1,24}",
        args in ".{0,200}"
    ) {
        let frame = GossipFrame::Relay { shard, kind, args };
        prop_assert_eq!(GossipFrame::parse(&frame.format()).unwrap(), frame);
    }

    #[test]
    fn test_chat_event_json_roundtrip(
        name in ".{0,40}",
        message in ".{0,200}",
        channel_id in any::<u32>(),
        user_id in any::<u32>(),
        country in "[a-z]{2}",
        send_api in any::<bool>()
    ) {
        let event = BrokerEvent::ChatMessage {
            name,
            message,
            channel_id,
            user_id: u64::from(user_id),
            country,
            send_api,
        };
        let args = event.to_json_args().unwrap();
        prop_assert_eq!(BrokerEvent::from_json_args("chatMessage", &args).unwrap(), event);
    }

    #[test]
    fn test_resp_publish_survives_any_split(
        topic in "[a-z0-9]{1,20}",
        payload in prop::collection::vec(any::<u8>(), 0..300),
        split in any::<prop::sample::Index>()
    ) {
        let frame = RespFrame::command(vec![
            Bytes::from_static(b"PUBLISH"),
            Bytes::from(topic),
            Bytes::from(payload),
        ]);
        let mut encoded = BytesMut::new();
        RespFrameCodec.encode(frame.clone(), &mut encoded).unwrap();

        let at = split.index(encoded.len());
        let mut codec = RespFrameCodec;
        let mut buf = BytesMut::from(&encoded[..at]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&encoded[at..]);
        prop_assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame));
        prop_assert!(buf.is_empty());
    }
}
