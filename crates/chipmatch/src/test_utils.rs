//! Synthetic chips and stores shared by the unit tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::descriptor::Descriptors;
use crate::store::{ChipRecord, InMemoryStore};
use crate::types::{ChipId, ImageId, Keypoint};

const TEST_CHIP_SIZE: [u32; 2] = [200, 200];

/// `n` uniformly random `dim`-byte descriptors.
pub(crate) fn random_descriptors(n: usize, dim: usize, seed: u64) -> Descriptors {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<u8> = (0..n * dim).map(|_| rng.gen()).collect();
    Descriptors::from_flat(dim, data).expect("n * dim bytes")
}

/// Chip in `image` with `n` random 32-dim descriptors and keypoints spread
/// over the chip.
pub(crate) fn random_chip(image: ImageId, n: usize, seed: u64) -> ChipRecord {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x9e37_79b9);
    let keypoints = (0..n)
        .map(|_| Keypoint::circular(rng.gen_range(0.0..200.0), rng.gen_range(0.0..200.0), 4.0))
        .collect();
    ChipRecord {
        image,
        name: None,
        size: TEST_CHIP_SIZE,
        keypoints,
        descriptors: random_descriptors(n, 32, seed),
    }
}

/// Chip in `image` whose descriptors are exactly `rows`; keypoint `i` sits
/// at `(10 i, 10)`.
pub(crate) fn chip_from_rows<R: AsRef<[u8]>>(image: ImageId, rows: &[R]) -> ChipRecord {
    ChipRecord {
        image,
        name: None,
        size: TEST_CHIP_SIZE,
        keypoints: (0..rows.len())
            .map(|i| Keypoint::circular(10.0 * i as f32, 10.0, 2.0))
            .collect(),
        descriptors: Descriptors::from_rows(rows).expect("uniform rows"),
    }
}

/// Chip in `image` with the given keypoints and all-zero 4-dim descriptors.
pub(crate) fn chip_with_keypoints(image: ImageId, keypoints: Vec<Keypoint>) -> ChipRecord {
    let n = keypoints.len();
    ChipRecord {
        image,
        name: None,
        size: TEST_CHIP_SIZE,
        keypoints,
        descriptors: Descriptors::from_flat(4, vec![0; 4 * n]).expect("flat"),
    }
}

pub(crate) fn store_from(chips: Vec<(ChipId, ChipRecord)>) -> InMemoryStore {
    let mut store = InMemoryStore::new();
    for (chip, record) in chips {
        store.insert(chip, record).expect("valid test chip");
    }
    store
}
