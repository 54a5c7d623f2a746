pub mod simba;
mod stats;

pub use stats::Stats;

/// Iterate indices of set bits, lowest first.
/// Used to walk the lanes selected by a SIMD `move_mask`.
pub fn bit_iter(bits: u32) -> BitIter {
    BitIter { bits }
}

#[derive(Copy, Clone, Debug)]
pub struct BitIter {
    bits: u32,
}

impl Iterator for BitIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.bits == 0 {
            return None;
        }
        let tz = self.bits.trailing_zeros() as usize;
        self.bits &= self.bits - 1;
        Some(tz)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = self.bits.count_ones() as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for BitIter {}

/// Round `value` up to the nearest multiple of `step`
pub fn round_up(value: u32, step: u32) -> u32 {
    value.div_ceil(step) * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;
    use test_case::test_case;

    #[test]
    fn bit_iter_lane_mask() {
        let result: Vec<usize> = bit_iter(0b1010).collect();
        assert!(result == vec![1, 3]);
    }

    #[test]
    fn bit_iter_all_bits() {
        let result: Vec<usize> = bit_iter(u32::MAX).collect();
        assert!(result == (0..(u32::BITS as usize)).collect::<Vec<_>>());
    }

    #[test]
    fn bit_iter_empty() {
        assert!(bit_iter(0).len() == 0);
        assert!(bit_iter(0).next().is_none());
    }

    #[test_case(0, 7, 0)]
    #[test_case(1, 7, 7)]
    #[test_case(7, 7, 7)]
    #[test_case(8, 10, 10)]
    #[test_case(21, 10, 30)]
    fn round_up_to_multiple(value: u32, step: u32, expected: u32) {
        assert!(round_up(value, step) == expected);
    }
}
