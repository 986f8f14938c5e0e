#![forbid(unsafe_code)]
//! Compaction integrity under allocation churn.

use sfvfs_block::BlockStore;
use sfvfs_types::{AccessMode, LogicalAddress, StoreConfig};
use tempfile::NamedTempFile;

/// Deterministic splitmix-style generator; tests must not depend on an
/// external RNG crate or on wall-clock seeding.
#[derive(Debug, Clone, Copy)]
struct Rng64 {
    state: u64,
}

impl Rng64 {
    fn seeded(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut mixed = self.state;
        mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        mixed ^ (mixed >> 31)
    }

    fn next_bool(&mut self) -> bool {
        self.next_u64() & 1 == 1
    }

    fn next_usize(&mut self, upper: usize) -> usize {
        if upper <= 1 {
            return 0;
        }
        usize::try_from(self.next_u64() % upper as u64).expect("bounded")
    }
}

fn churn_config() -> StoreConfig {
    StoreConfig {
        block_size: 64,
        max_blocks: 100 * 1024,
        free_groups_cache_size: 2,
        free_address_cache_size: 100,
        mode: AccessMode::ReadWrite,
    }
}

#[test]
fn compaction_preserves_live_blocks_across_churn() {
    let file = NamedTempFile::new().unwrap();
    let store = BlockStore::open(file.path(), churn_config()).unwrap();

    let mut live: Vec<(LogicalAddress, i32)> = Vec::new();
    let mut total: i64 = 0;

    for round in 1..10 {
        let mut rng = Rng64::seeded(round);

        for j in 0..1000 {
            let value = i32::try_from(round).unwrap() * j;
            let block = store.allocate().unwrap();
            block.write_i32(0, value).unwrap();
            live.push((block.address(), value));
            total += i64::from(value);
        }

        for _ in 0..1000 {
            if rng.next_bool() && !live.is_empty() {
                let (address, value) = live.swap_remove(rng.next_usize(live.len()));
                total -= i64::from(value);
                store.deallocate(address).unwrap();
            }
        }

        assert!(store.free_blocks().unwrap() > 64);
        store.compact().unwrap();
        assert!(
            store.free_blocks().unwrap() < 64,
            "round {round}: compaction must leave less than one group free"
        );

        // Every surviving logical address still reads its own value.
        let mut readback: i64 = 0;
        for (address, value) in &live {
            let block = store.get(*address).unwrap();
            assert_eq!(block.read_i32(0).unwrap(), *value);
            readback += i64::from(*value);
        }
        assert_eq!(readback, total);
    }
}

#[test]
fn compaction_survives_reopen() {
    let file = NamedTempFile::new().unwrap();
    let mut live: Vec<(LogicalAddress, i32)> = Vec::new();

    {
        let store = BlockStore::open(file.path(), churn_config()).unwrap();
        let mut rng = Rng64::seeded(42);

        for value in 0..500 {
            let block = store.allocate().unwrap();
            block.write_i32(0, value).unwrap();
            live.push((block.address(), value));
        }
        live.retain(|(address, _)| {
            if rng.next_bool() {
                store.deallocate(*address).unwrap();
                false
            } else {
                true
            }
        });
        store.compact().unwrap();
        store.close().unwrap();
    }

    let store = BlockStore::open(file.path(), churn_config()).unwrap();
    assert!(store.free_blocks().unwrap() < 64);
    for (address, value) in &live {
        assert_eq!(store.get(*address).unwrap().read_i32(0).unwrap(), *value);
    }
}

#[test]
fn compacting_an_empty_container_is_a_no_op() {
    let file = NamedTempFile::new().unwrap();
    let store = BlockStore::open(file.path(), churn_config()).unwrap();

    store.compact().unwrap();
    assert_eq!(store.total_blocks().unwrap(), 0);
    assert_eq!(store.free_blocks().unwrap(), 0);

    // Fully draining the container lets compaction drop every group.
    let a = store.allocate().unwrap().address();
    let b = store.allocate().unwrap().address();
    store.deallocate(a).unwrap();
    store.deallocate(b).unwrap();
    store.compact().unwrap();
    assert_eq!(store.total_blocks().unwrap(), 0);
}
