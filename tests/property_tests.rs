//! Property-based tests for the Tether relay layer
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Message Buffer Properties
// ============================================================================

mod buffer_properties {
    use super::*;
    use std::time::Duration;
    use tether_relay::BufferLimits;
    use tether_relay::buffer::{DrainReason, MessageBuffer};
    use tokio::time::Instant;

    proptest! {
        /// At rest the buffer holds fewer than max_count items and fewer than
        /// max_bytes bytes, and nothing is lost or reordered
        #[test]
        fn buffer_never_rests_at_limits(
            max_count in 1usize..16,
            max_bytes in 1usize..512,
            sizes in prop::collection::vec(0usize..128, 0..64),
        ) {
            let limits = BufferLimits::new(Duration::from_secs(60), max_count, max_bytes);
            let mut buffer = MessageBuffer::new(limits);
            let now = Instant::now();
            let mut drained = Vec::new();

            for (i, size) in sizes.iter().enumerate() {
                let item = vec![(i & 0xFF) as u8; *size];
                if let Some(drain) = buffer.push(item, now) {
                    prop_assert!(drain.reason.is_overflow());
                    drained.extend(drain.items);
                }
                prop_assert!(buffer.len() < max_count);
                prop_assert!(buffer.bytes() < max_bytes);
            }

            if let Some(drain) = buffer.flush() {
                prop_assert_eq!(drain.reason, DrainReason::Flush);
                drained.extend(drain.items);
            }
            prop_assert_eq!(drained.len(), sizes.len());
            for (i, item) in drained.iter().enumerate() {
                prop_assert_eq!(item.len(), sizes[i]);
                prop_assert!(item.iter().all(|b| *b == (i & 0xFF) as u8));
            }
        }

        /// The age drain fires at max_age after the oldest insertion, not before
        #[test]
        fn age_drain_not_before_deadline(
            max_age_ms in 1u64..10_000,
            later_ms in prop::collection::vec(0u64..10_000, 0..8),
            at_ms in 0u64..20_000,
        ) {
            let limits = BufferLimits::age_only(Duration::from_millis(max_age_ms));
            let mut buffer = MessageBuffer::new(limits);
            let start = Instant::now();

            buffer.push(vec![0u8], start);
            for offset in &later_ms {
                prop_assert!(buffer.push(vec![1u8], start + Duration::from_millis(*offset)).is_none());
            }

            let drained = buffer.take_expired(start + Duration::from_millis(at_ms));
            if at_ms >= max_age_ms {
                let drain = drained.expect("expired buffer drains");
                prop_assert_eq!(drain.reason, DrainReason::Age);
                prop_assert_eq!(drain.items.len(), later_ms.len() + 1);
                prop_assert!(buffer.is_empty());
            } else {
                prop_assert!(drained.is_none());
                prop_assert_eq!(buffer.len(), later_ms.len() + 1);
            }
        }
    }
}

// ============================================================================
// Relay Set Properties
// ============================================================================

mod relay_set_properties {
    use super::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use tether_relay::peer::MAX_RELAYS;
    use tether_relay::relay::CandidatePool;
    use tether_relay::{PeerAddress, PeerId, PeerSocketAddress};

    fn relay(n: u8) -> PeerSocketAddress {
        SocketAddr::from(([10, 20, 0, n], 4000)).into()
    }

    proptest! {
        /// The advertised relay list stays bounded and duplicate-free, and the
        /// relayed flag follows it
        #[test]
        fn relay_list_bounded_and_unique(
            max in 1usize..8,
            pushes in prop::collection::vec(0u8..12, 0..32),
        ) {
            let mut address = PeerAddress::new(
                PeerId::from_data(b"relay-set"),
                SocketAddr::from(([10, 20, 1, 1], 4000)),
            );

            for n in &pushes {
                address = address.push_relay(relay(*n), max);
                prop_assert!(address.relays().contains(&relay(*n)));
            }

            let relays = address.relays();
            prop_assert!(relays.len() <= max.min(MAX_RELAYS));
            let unique: HashSet<_> = relays.iter().collect();
            prop_assert_eq!(unique.len(), relays.len());
            prop_assert_eq!(address.is_relayed(), !relays.is_empty());
            prop_assert_eq!(address.is_relayed(), !pushes.is_empty());
        }

        /// Replacing the relay set keeps the most recently offered relays, in order
        #[test]
        fn with_relays_keeps_order(count in 0u8..8, max in 1usize..8) {
            let relays: Vec<_> = (0..count).map(relay).collect();
            let address = PeerAddress::new(
                PeerId::from_data(b"ordered"),
                SocketAddr::from(([10, 20, 1, 2], 4000)),
            )
            .with_relays(relays.iter().copied(), max);

            let kept = relays.len().min(max).min(MAX_RELAYS);
            prop_assert_eq!(address.relays(), &relays[relays.len() - kept..]);
        }

        /// A candidate is never handed out twice, whatever is re-offered
        #[test]
        fn candidate_pool_never_repeats(
            offers in prop::collection::vec(prop::collection::vec(0u8..16, 0..8), 1..6),
            take in 1usize..6,
        ) {
            let mut pool = CandidatePool::new();
            let mut handed_out = HashSet::new();

            for round in offers {
                pool.offer_all(round.into_iter().map(|n| {
                    PeerAddress::new(PeerId::from_data(&[n]), SocketAddr::from(([10, 21, 0, n], 4000)))
                }));
                for candidate in pool.take(take) {
                    prop_assert!(handed_out.insert(candidate.id()));
                    prop_assert!(pool.is_tried(&candidate.id()));
                }
            }
        }
    }
}
