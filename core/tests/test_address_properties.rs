// Property tests: hierarchical addressing
//
// Flat ids and per-level addresses must convert into each other exactly, and
// address comparison must report the highest level two addresses differ at.

use gnodemesh_core::{AddressMap, Nip, SlotChange};
use proptest::prelude::*;

fn unit_map(levels: usize, group_size: usize) -> AddressMap<()> {
    AddressMap::new(levels, group_size, Box::new(|_, _| ()))
}

// (levels, group_size, flat id inside the address space)
fn space_and_id() -> impl Strategy<Value = (usize, usize, u64)> {
    (1usize..=4, 2usize..=64).prop_flat_map(|(levels, group_size)| {
        let space = (group_size as u64).pow(levels as u32);
        (Just(levels), Just(group_size), 0..space)
    })
}

proptest! {
    #[test]
    fn test_flat_round_trip((levels, group_size, flat) in space_and_id()) {
        let map = unit_map(levels, group_size);
        let nip = map.to_address(flat).unwrap();
        prop_assert_eq!(nip.levels(), levels);
        prop_assert!(nip.digits().iter().all(|&d| (d as usize) < group_size));
        prop_assert_eq!(map.to_flat(&nip).unwrap(), flat);
    }

    #[test]
    fn test_address_round_trip(digits in proptest::collection::vec(0u16..200, 1..5)) {
        let map = unit_map(digits.len(), 200);
        let nip = Nip::new(digits);
        let flat = map.to_flat(&nip).unwrap();
        prop_assert_eq!(map.to_address(flat).unwrap(), nip);
    }

    #[test]
    fn test_compare_reports_differing_level(
        (levels, group_size, flat) in space_and_id(),
        level_seed in any::<usize>(),
        shift in 1usize..64,
    ) {
        let map = unit_map(levels, group_size);
        let a = map.to_address(flat).unwrap();
        prop_assert_eq!(map.compare(&a, &a), None);

        let level = level_seed % levels;
        let b = a.with_digit(level, (a.digit(level) + shift % (group_size - 1) + 1) % group_size);
        prop_assert_ne!(&a, &b);
        prop_assert_eq!(map.compare(&a, &b), Some(level));
        prop_assert_eq!(map.compare(&b, &a), Some(level));
    }

    #[test]
    fn test_own_address_always_in_prefix((levels, group_size, flat) in space_and_id()) {
        let mut map = unit_map(levels, group_size);
        let me = map.to_address(flat).unwrap();
        map.set_me(me.clone()).unwrap();
        prop_assert!(map.contains_prefix(&me, 0));
    }

    #[test]
    fn test_add_remove_moves_free_count_by_one(
        group_size in 2usize..64,
        id_seed in any::<usize>(),
    ) {
        let mut map = unit_map(2, group_size);
        let id = id_seed % group_size;
        let free = map.free_count(0).unwrap();

        prop_assert_eq!(map.add(0, id).unwrap(), SlotChange::Occupied);
        prop_assert!(map.get(0, id).unwrap().is_some());
        prop_assert_eq!(map.free_count(0).unwrap(), free - 1);

        prop_assert_eq!(map.remove(0, id).unwrap(), SlotChange::Freed);
        prop_assert!(map.get(0, id).unwrap().is_none());
        prop_assert_eq!(map.free_count(0).unwrap(), free);
    }
}

#[test]
fn test_concrete_three_level_addresses() {
    let map = unit_map(3, 255);
    assert_eq!(map.to_address(127).unwrap(), Nip::new(vec![127, 0, 0]));
    assert_eq!(map.to_flat(&Nip::new(vec![127, 0, 0])).unwrap(), 127);
    assert_eq!(
        map.compare(&Nip::new(vec![127, 0, 1]), &Nip::new(vec![127, 0, 0])),
        Some(2)
    );
}

#[test]
fn test_fresh_map_free_count() {
    let mut map = unit_map(3, 255);
    assert_eq!(map.free_count(0).unwrap(), 255);
    map.add(0, 0).unwrap();
    assert_eq!(map.free_count(0).unwrap(), 254);
    map.remove(0, 0).unwrap();
    assert_eq!(map.free_count(0).unwrap(), 255);
}
