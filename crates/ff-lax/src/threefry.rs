//! Counter-based ThreeFry-2x32 generator used for categorical sampling.
//!
//! Salmon et al., "Parallel Random Numbers: As Easy as 1, 2, 3" (SC'11).
//! Keys are split and folded rather than advanced, so every draw is a pure
//! function of the seed and the draw's position.

use crate::LaxError;

/// Skein rotation constants for the two-word variant.
const ROTATIONS: [u32; 8] = [13, 15, 26, 6, 17, 29, 16, 24];

const NUM_ROUNDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleKey(pub [u32; 2]);

impl SampleKey {
    /// Key from a 64-bit seed: high word first.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self([(seed >> 32) as u32, seed as u32])
    }

    /// Two independent child keys.
    #[must_use]
    pub fn split(self) -> (Self, Self) {
        (
            Self(threefry2x32(self.0, [0, 0])),
            Self(threefry2x32(self.0, [0, 1])),
        )
    }

    /// Derives a key for the `data`-th independent use of `self`.
    #[must_use]
    pub fn fold_in(self, data: u32) -> Self {
        Self(threefry2x32(self.0, [data, 0]))
    }
}

#[must_use]
pub fn threefry2x32(key: [u32; 2], data: [u32; 2]) -> [u32; 2] {
    const KS_PARITY: u32 = 0x1BD1_1BDA;
    let schedule = [key[0], key[1], key[0] ^ key[1] ^ KS_PARITY];

    let mut x0 = data[0].wrapping_add(key[0]);
    let mut x1 = data[1].wrapping_add(key[1]);
    for round in 0..NUM_ROUNDS {
        x0 = x0.wrapping_add(x1);
        x1 = x1.rotate_left(ROTATIONS[round % 8]) ^ x0;
        // Key injection every four rounds.
        if (round + 1) % 4 == 0 {
            let inject = (round + 1) / 4;
            x0 = x0.wrapping_add(schedule[inject % 3]);
            x1 = x1.wrapping_add(schedule[(inject + 1) % 3].wrapping_add(inject as u32));
        }
    }
    [x0, x1]
}

/// `count` draws from `[0, 1)`, using the top 53 bits of each block.
#[must_use]
pub fn uniform(key: SampleKey, count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| {
            let [hi, lo] = threefry2x32(key.0, [i as u32, (i as u64 >> 32) as u32]);
            let bits = ((u64::from(hi) << 32) | u64::from(lo)) >> 11;
            bits as f64 / (1_u64 << 53) as f64
        })
        .collect()
}

/// Draws one category per row of `logits`, a row-major `rows x categories`
/// buffer of unnormalized log-probabilities.
pub fn categorical(
    key: SampleKey,
    logits: &[f64],
    categories: usize,
) -> Result<Vec<usize>, LaxError> {
    if categories == 0 || logits.len() % categories != 0 {
        return Err(LaxError::SizeMismatch {
            name: "categories".to_owned(),
            lhs: logits.len(),
            rhs: categories,
        });
    }
    let rows = logits.len() / categories;
    let draws = uniform(key, rows);
    let mut out = Vec::with_capacity(rows);
    for (row, u) in logits.chunks(categories).zip(draws) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(LaxError::IndexOutOfRange {
                name: "logits".to_owned(),
                value: max,
                size: categories,
            });
        }
        let weights: Vec<f64> = row.iter().map(|l| (l - max).exp()).collect();
        let threshold = u * weights.iter().sum::<f64>();
        let mut acc = 0.0;
        let mut choice = categories - 1;
        for (k, w) in weights.iter().enumerate() {
            acc += w;
            if threshold < acc {
                choice = k;
                break;
            }
        }
        out.push(choice);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threefry_is_deterministic_and_key_sensitive() {
        let a = threefry2x32([0, 0], [0, 0]);
        assert_eq!(a, threefry2x32([0, 0], [0, 0]));
        assert_ne!(a, [0, 0]);
        assert_ne!(a, threefry2x32([0, 1], [0, 0]));
        assert_ne!(a, threefry2x32([0, 0], [0, 1]));
    }

    #[test]
    fn split_and_fold_in_derive_distinct_keys() {
        let key = SampleKey::from_seed(42);
        assert_eq!(key.0, [0, 42]);
        assert_eq!(SampleKey::from_seed(0x0000_0001_0000_002A).0, [1, 42]);

        let (left, right) = key.split();
        assert_ne!(left, right);
        assert_ne!(left, key);
        assert_eq!(key.split(), (left, right));
        assert_ne!(key.fold_in(0), key.fold_in(1));
    }

    #[test]
    fn threefry_bits_are_balanced() {
        let key = [42_u32, 7_u32];
        let samples = 10_000_u32;
        let mut counts = [0_u64; 64];
        for i in 0..samples {
            let block = threefry2x32(key, [i, 0]);
            for bit in 0..32 {
                if block[0] & (1 << bit) != 0 {
                    counts[bit] += 1;
                }
                if block[1] & (1 << bit) != 0 {
                    counts[32 + bit] += 1;
                }
            }
        }
        let expected = f64::from(samples) / 2.0;
        let chi_sq: f64 = counts
            .iter()
            .map(|c| (*c as f64 - expected).powi(2) / expected)
            .sum();
        // 64 degrees of freedom; p = 0.001 is near 103.
        assert!(chi_sq < 150.0, "chi-squared {chi_sq:.1} too large");
    }

    #[test]
    fn uniform_stays_in_unit_interval() {
        let draws = uniform(SampleKey::from_seed(7), 2_000);
        assert!(draws.iter().all(|u| (0.0..1.0).contains(u)));
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        assert!((mean - 0.5).abs() < 0.05, "mean {mean}");
    }

    #[test]
    fn categorical_follows_logits() {
        let logits = [0.0, f64::NEG_INFINITY, f64::NEG_INFINITY, 0.0];
        let draws = categorical(SampleKey::from_seed(3), &logits, 2).expect("valid logits");
        assert_eq!(draws, vec![0, 1]);

        let skewed: Vec<f64> = (0..1_000).flat_map(|_| [0.0, 3.0_f64.ln()]).collect();
        let draws = categorical(SampleKey::from_seed(11), &skewed, 2).expect("valid logits");
        let ones = draws.iter().filter(|k| **k == 1).count() as f64 / 1_000.0;
        assert!((ones - 0.75).abs() < 0.06, "frequency {ones}");

        let err = categorical(SampleKey::from_seed(0), &[0.0, 1.0, 2.0], 2).expect_err("ragged");
        assert!(matches!(err, LaxError::SizeMismatch { .. }));
    }
}
