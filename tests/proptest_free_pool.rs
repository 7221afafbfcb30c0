use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use proptest::prelude::*;

use dhcpcore::AddressRange;
use dhcpcore::free_pool::FreePool;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    Free(u8),
    MarkUsed(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        2 => any::<u8>().prop_map(Op::Free),
        1 => any::<u8>().prop_map(Op::MarkUsed),
    ]
}

fn pool(size: u8) -> FreePool {
    let start = Ipv4Addr::new(10, 0, 0, 0);
    let end = Ipv4Addr::new(10, 0, 0, size);
    FreePool::new(AddressRange::v4(start, end))
}

/// Candidate addresses, including a few past the end of the pool.
fn candidate(index: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, index))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn used_plus_free_is_size(size in 0u8..64, ops in prop::collection::vec(op(), 0..200)) {
        let pool = pool(size);
        for op in ops {
            match op {
                Op::Allocate => { pool.allocate_next(); }
                Op::Free(index) => { pool.mark_free(candidate(index % 80)); }
                Op::MarkUsed(index) => { pool.mark_used(candidate(index % 80)); }
            }
            prop_assert_eq!(pool.used_count() + pool.free_count(), pool.size());
        }
    }

    #[test]
    fn allocations_are_unique_and_in_range(
        size in 0u8..64,
        ops in prop::collection::vec(op(), 0..200)
    ) {
        let pool = pool(size);
        let mut held = HashSet::new();
        for op in ops {
            match op {
                Op::Allocate => {
                    if let Some(ip) = pool.allocate_next() {
                        prop_assert!(pool.range().contains(ip));
                        prop_assert!(held.insert(ip), "{} handed out twice", ip);
                    } else {
                        prop_assert_eq!(pool.free_count(), 0);
                    }
                }
                Op::Free(index) => {
                    let ip = candidate(index % 80);
                    let freed = pool.mark_free(ip);
                    prop_assert_eq!(freed, held.remove(&ip));
                }
                Op::MarkUsed(index) => {
                    let ip = candidate(index % 80);
                    if pool.mark_used(ip) {
                        held.insert(ip);
                    }
                }
            }
            prop_assert_eq!(pool.used_count(), held.len() as u128);
        }
    }

    #[test]
    fn interval_count_never_exceeds_used(ops in prop::collection::vec(op(), 0..300)) {
        let pool = pool(63);
        for op in ops {
            match op {
                Op::Allocate => { pool.allocate_next(); }
                Op::Free(index) => { pool.mark_free(candidate(index % 64)); }
                Op::MarkUsed(index) => { pool.mark_used(candidate(index % 64)); }
            }
            prop_assert!(pool.interval_count() as u128 <= pool.used_count());
        }
    }
}
