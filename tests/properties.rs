//! Property tests: random operation sequences against the public API, with
//! payload integrity checks and the heap invariant checker run after every
//! step.

#![cfg(not(miri))]

use std::ptr::NonNull;

use proptest::prelude::*;

use segalloc::Segalloc;

/// One step of a random allocation workload. Indices are reduced modulo the
/// live set at execution time.
#[derive(Debug, Clone)]
enum Op {
    Malloc(usize),
    Free(usize),
    Realloc(usize, usize),
    Calloc(usize, usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..2048).prop_map(Op::Malloc),
        3 => any::<usize>().prop_map(Op::Free),
        2 => (any::<usize>(), 1usize..2048).prop_map(|(i, size)| Op::Realloc(i, size)),
        1 => (1usize..64, 1usize..64).prop_map(|(count, size)| Op::Calloc(count, size)),
    ]
}

/// A live allocation: pointer, requested size, and the byte pattern written
/// over it.
struct Live {
    address: NonNull<u8>,
    size: usize,
    fill: u8,
}

unsafe fn verify_fill(live: &Live) {
    for i in 0..live.size {
        assert_eq!(
            live.address.as_ptr().add(i).read(),
            live.fill,
            "payload corrupted at offset {i}"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_workloads_preserve_every_invariant(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let segalloc = Segalloc::new();
        let mut live: Vec<Live> = Vec::new();
        let mut next_fill = 0u8;

        unsafe {
            for op in ops {
                match op {
                    Op::Malloc(size) => {
                        let address = segalloc.malloc(size).expect("malloc failed");
                        next_fill = next_fill.wrapping_add(1);
                        address.as_ptr().write_bytes(next_fill, size);
                        live.push(Live { address, size, fill: next_fill });
                    }
                    Op::Free(index) => {
                        if live.is_empty() {
                            continue;
                        }
                        let entry = live.swap_remove(index % live.len());
                        verify_fill(&entry);
                        segalloc.free(Some(entry.address));
                    }
                    Op::Realloc(index, new_size) => {
                        if live.is_empty() {
                            continue;
                        }
                        let index = index % live.len();
                        let old = &live[index];
                        let old_fill = old.fill;
                        let preserved = old.size.min(new_size);

                        let address = segalloc
                            .realloc(Some(old.address), new_size)
                            .expect("realloc failed");

                        for i in 0..preserved {
                            prop_assert_eq!(address.as_ptr().add(i).read(), old_fill);
                        }

                        next_fill = next_fill.wrapping_add(1);
                        address.as_ptr().write_bytes(next_fill, new_size);
                        live[index] = Live { address, size: new_size, fill: next_fill };
                    }
                    Op::Calloc(count, size) => {
                        let address = segalloc.calloc(count, size).expect("calloc failed");
                        let total = count * size;

                        for i in 0..total {
                            prop_assert_eq!(address.as_ptr().add(i).read(), 0);
                        }

                        next_fill = next_fill.wrapping_add(1);
                        address.as_ptr().write_bytes(next_fill, total);
                        live.push(Live { address, size: total, fill: next_fill });
                    }
                }

                prop_assert!(segalloc.check_heap().is_ok());
            }

            // Drain the survivors; their payloads must still be intact.
            for entry in live.drain(..) {
                verify_fill(&entry);
                segalloc.free(Some(entry.address));
            }
        }

        prop_assert!(segalloc.check_heap().is_ok());

        // After everything is freed the heap serves a large request again.
        let big = segalloc.malloc(100_000).expect("heap unusable after workload");
        unsafe { segalloc.free(Some(big)) };
        prop_assert!(segalloc.check_heap().is_ok());
    }

    #[test]
    fn alloc_free_pairs_round_trip(size in 1usize..100_000) {
        let segalloc = Segalloc::new();

        let first = segalloc.malloc(size).expect("malloc failed");
        unsafe {
            first.as_ptr().write_bytes(0xA5, size);
            segalloc.free(Some(first));
        }
        prop_assert!(segalloc.check_heap().is_ok());

        // The freed block coalesced back, so the same request is served
        // from the same spot.
        let second = segalloc.malloc(size).expect("second malloc failed");
        prop_assert_eq!(second, first);
        unsafe { segalloc.free(Some(second)) };
    }
}
