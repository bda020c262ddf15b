/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Property-based checks of the quantified invariants against randomized
//! sequences of alloc/realloc/free.

use proptest::prelude::*;
use regionvm::{next_power_of_two, Slice, VirtualMemory, CHUNK_MAXIMUM_CAPACITY, CHUNK_MINIMUM_CAPACITY};

#[derive(Debug, Clone)]
enum Op {
    Alloc(u32),
    Free(usize),
    Realloc(usize, u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..=4096).prop_map(Op::Alloc),
        (0usize..64).prop_map(Op::Free),
        (0usize..64, 1u32..=4096).prop_map(|(i, s)| Op::Realloc(i, s)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn next_power_of_two_is_a_power_of_two_ge_input(n in any::<u32>()) {
        let result = next_power_of_two(n);
        prop_assert!(result >= n.min(CHUNK_MAXIMUM_CAPACITY));
        prop_assert!(result >= CHUNK_MINIMUM_CAPACITY || result == CHUNK_MAXIMUM_CAPACITY);
        if result != CHUNK_MAXIMUM_CAPACITY {
            prop_assert!(result.is_power_of_two());
        }
    }

    #[test]
    fn random_op_sequence_preserves_counter_consistency(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let mut vm = VirtualMemory::new(0);
        let mut live: Vec<Slice> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Some(slice) = vm.alloc(size) {
                        live.push(slice);
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let slice = live.remove(idx % live.len());
                        vm.free(Some(slice));
                    }
                }
                Op::Realloc(idx, size) => {
                    if !live.is_empty() {
                        let idx = idx % live.len();
                        // Pass a clone (same underlying reservation) so a
                        // failed realloc leaves `live[idx]` pointing at the
                        // still-valid original instead of losing track of it.
                        let slice = live[idx].clone();
                        if let Some(resized) = vm.realloc(Some(slice), size) {
                            prop_assert_eq!(resized.size(), size);
                            live[idx] = resized;
                        }
                    }
                }
            }

            let expected: u64 = live.iter().map(|s| s.size() as u64).sum();
            prop_assert_eq!(vm.allocated_total(), expected);
        }
    }
}
