use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Work represented by a compact target (nBits): `2^256 / (target + 1)`.
/// The canonical Bitcoin tip is the one with the greatest accumulated sum
/// of this value from genesis (§4.1).
pub fn calculate_work_from_bits(n_bits: u32) -> [u8; 32] {
    let exponent = n_bits >> 24;
    let mantissa = n_bits & 0x00ffffff;

    if mantissa == 0 || exponent == 0 {
        return [0u8; 32];
    }

    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        let shift_bytes = exponent - 3;
        BigUint::from(mantissa) << (8 * shift_bytes)
    };

    if target.is_zero() {
        return [0u8; 32];
    }

    let numerator = BigUint::one() << 256;
    let denominator = target + BigUint::one();
    let work: BigUint = numerator / denominator;

    let work_bytes = work.to_bytes_be();
    let mut result = [0u8; 32];
    let start = 32 - work_bytes.len();
    result[start..].copy_from_slice(&work_bytes);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_difficulty_yields_more_work() {
        let bits = 0x1d00ffff;
        let work = calculate_work_from_bits(bits);
        assert_ne!(work, [0u8; 32]);

        let higher_difficulty_bits = 0x1b0404cb;
        let higher_work = calculate_work_from_bits(higher_difficulty_bits);
        assert!(BigUint::from_bytes_be(&higher_work) > BigUint::from_bytes_be(&work));
    }

    #[test]
    fn zero_bits_is_zero_work() {
        assert_eq!(calculate_work_from_bits(0), [0u8; 32]);
    }
}
