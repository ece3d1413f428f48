use num_bigint::{BigUint, RandBigInt};
use num_traits::One;

use crate::MILLER_RABIN_ROUNDS;

/// Miller-Rabin probabilistic primality test.
///
/// Returns true if `n` is probably prime, false if it is definitely
/// composite. The false-positive probability is bounded by `4^-rounds`,
/// so 20 rounds are plenty for key generation.
pub fn is_probable_prime(n: &BigUint, rounds: u32) -> bool {
    let two = BigUint::from(2u32);
    let three = BigUint::from(3u32);

    if *n < two {
        return false;
    }
    if *n == two || *n == three {
        return true;
    }
    if !n.bit(0) {
        return false;
    }

    // Write n - 1 as 2^s * d with d odd.
    let n_minus_one = n - 1u32;
    let s = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> s;

    let mut rng = rand::thread_rng();

    // Witness loop: each surviving round quarters the chance of a false
    // positive.
    for _ in 0..rounds {
        // Uniform witness in [2, n-2].
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);

        if x.is_one() || x == n_minus_one {
            continue;
        }

        let mut witnessed_composite = true;
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                witnessed_composite = false;
                break;
            }
        }

        if witnessed_composite {
            return false;
        }
    }

    true
}

/// Generate a random probable prime of exactly `bits` bits.
///
/// Candidates are drawn with the high bit forced set (so the product of two
/// such primes has the full modulus width) and the low bit forced set, then
/// filtered through [`is_probable_prime`].
pub fn generate_prime(bits: u64) -> BigUint {
    let mut rng = rand::thread_rng();

    loop {
        let mut candidate = rng.gen_biguint(bits);
        candidate.set_bit(bits - 1, true);
        candidate.set_bit(0, true);

        if is_probable_prime(&candidate, MILLER_RABIN_ROUNDS) {
            return candidate;
        }
    }
}
