//! The crate installed as the process-wide global allocator, exercising
//! standard collections. Every allocation in this test binary, including
//! the test harness itself, goes through the heap.
//!
//! Not under Miri: there the platform layer mocks its memory through
//! `std::alloc`, which would bounce straight back into this allocator.

#![cfg(not(miri))]

use std::collections::HashMap;

use segalloc::Segalloc;

#[global_allocator]
static GLOBAL: Segalloc = Segalloc::new();

#[test]
fn boxes() {
    let b = Box::new(42u64);
    assert_eq!(*b, 42);
    drop(b);
}

#[test]
fn growing_vec() {
    let count = 10_000;

    let mut v = Vec::new();
    for i in 0..count {
        v.push(i);
    }
    assert_eq!(v.len(), count);
    assert_eq!(v[count / 2], count / 2);
}

#[test]
fn strings() {
    let mut s = String::new();
    for _ in 0..100 {
        s.push_str("hello world ");
    }
    assert!(s.len() >= 1200);
}

#[test]
fn hashmap() {
    let mut map = HashMap::new();
    let count = 500;
    for i in 0..count {
        map.insert(i, format!("value_{i}"));
    }
    assert_eq!(map.len(), count);
    assert_eq!(map[&42], "value_42");
}

#[test]
fn nested_collections() {
    let mut v: Vec<Vec<u32>> = Vec::new();
    for i in 0..50 {
        v.push((0..i).collect());
    }
    assert_eq!(v[49].len(), 49);
}

#[test]
fn large_allocation() {
    let len = 512 * 1024;
    let v = vec![0xABu8; len];
    assert_eq!(v.len(), len);
    assert!(v.iter().all(|&b| b == 0xAB));
}

#[test]
fn alloc_free_cycles() {
    for _ in 0..100 {
        let v: Vec<u64> = (0..100).collect();
        assert_eq!(v.len(), 100);
        drop(v);
    }
}

#[test]
fn heap_stays_consistent_under_load() {
    let mut keep = Vec::new();
    for i in 0..100usize {
        keep.push(vec![i as u8; i * 7 % 256 + 1]);
    }

    // The harness and the other tests have live allocations too; the
    // invariants must hold regardless.
    assert!(GLOBAL.check_heap().is_ok());

    keep.clear();
    assert!(GLOBAL.check_heap().is_ok());
}
