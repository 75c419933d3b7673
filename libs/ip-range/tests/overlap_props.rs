use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ip_range::{IpRange, RangeError, addr_key};
use proptest::prelude::*;

fn v4_range() -> impl Strategy<Value = IpRange> {
    (any::<u32>(), any::<u32>()).prop_map(|(a, b)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        IpRange::new(Ipv4Addr::from(lo).into(), Ipv4Addr::from(hi).into()).unwrap()
    })
}

// narrow keyspace so overlaps actually happen
fn small_v4_range() -> impl Strategy<Value = IpRange> {
    (0u32..64, 0u32..64).prop_map(|(a, b)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let base = u32::from(Ipv4Addr::new(10, 0, 0, 0));
        IpRange::new(
            Ipv4Addr::from(base + lo).into(),
            Ipv4Addr::from(base + hi).into(),
        )
        .unwrap()
    })
}

fn v6_range() -> impl Strategy<Value = IpRange> {
    (any::<u128>(), any::<u128>()).prop_map(|(a, b)| {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        IpRange::new(Ipv6Addr::from(lo).into(), Ipv6Addr::from(hi).into()).unwrap()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    #[test]
    fn overlap_is_symmetric_v4(a in small_v4_range(), b in small_v4_range()) {
        prop_assert_eq!(a.overlaps(&b).unwrap(), b.overlaps(&a).unwrap());
    }

    #[test]
    fn overlap_is_symmetric_wide(a in v4_range(), b in v4_range(), c in v6_range(), d in v6_range()) {
        prop_assert_eq!(a.overlaps(&b).unwrap(), b.overlaps(&a).unwrap());
        prop_assert_eq!(c.overlaps(&d).unwrap(), d.overlaps(&c).unwrap());
    }

    #[test]
    fn overlap_matches_shared_address(a in small_v4_range(), b in small_v4_range()) {
        let shared = (addr_key(a.begin())..=addr_key(a.end()))
            .any(|k| {
                let ip: IpAddr = Ipv4Addr::from(k as u32).into();
                b.contains(ip).unwrap()
            });
        prop_assert_eq!(a.overlaps(&b).unwrap(), shared);
    }

    #[test]
    fn range_overlaps_itself(a in v6_range()) {
        prop_assert!(a.overlaps(&a).unwrap());
        prop_assert!(a.contains(a.begin()).unwrap());
        prop_assert!(a.contains(a.end()).unwrap());
    }

    #[test]
    fn mixed_family_never_compares(a in v4_range(), c in v6_range()) {
        let is_mixed = matches!(a.overlaps(&c), Err(RangeError::MixedFamily { .. }));
        prop_assert!(is_mixed);
        let is_mixed = matches!(c.overlaps(&a), Err(RangeError::MixedFamily { .. }));
        prop_assert!(is_mixed);
    }
}
