//! Diffie–Hellman-style key agreement over 16-bit primes.
//!
//! The exponent and modulus space is tiny; this derives a per-session
//! cipher key and nothing more. It is not a secure key exchange.

use std::sync::LazyLock;

use rand::Rng;
use tracing::debug;

use crate::cipher::SharedSecret;
use crate::error::{KeyAgreementError, SessionError};
use crate::transport::{Connection, ConnectionExt};

/// Fixed generator shared by both ends.
pub const PRIMITIVE_ROOT: u16 = 26363;
/// Lower bound (inclusive) of the prime search range.
pub const PRIME_RANGE_START: u32 = 0;
/// Upper bound (exclusive) of the prime search range.
pub const PRIME_RANGE_END: u32 = 1 << 16;

static DEFAULT_PRIMES: LazyLock<Vec<u16>> =
    LazyLock::new(|| primes_in_range(PRIME_RANGE_START, PRIME_RANGE_END));

/// Computes `base^exp mod modulus` by square-and-multiply, or `None` for a
/// zero modulus.
///
/// Products are widened to `u128`, so any `u64` modulus is safe.
#[must_use]
pub fn mod_exp(base: u64, exp: u64, modulus: u64) -> Option<u64> {
    match modulus {
        0 => None,
        1 => Some(0),
        _ => Some(pow_mod(base, exp, modulus)),
    }
}

fn pow_mod(base: u64, exp: u64, modulus: u64) -> u64 {
    let mut result = 1u64;
    let mut base = base % modulus;
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, modulus);
        }
        exp >>= 1;
        base = mul_mod(base, base, modulus);
    }
    result
}

fn mul_mod(a: u64, b: u64, modulus: u64) -> u64 {
    // Widen so moduli above u32 stay correct too; the remainder is < modulus.
    let wide = u128::from(a) * u128::from(b) % u128::from(modulus);
    u64::try_from(wide).unwrap_or_default()
}

/// Trial-division primality test.
#[must_use]
pub fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    let n = u64::from(n);
    let mut i = 2u64;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

/// Lists every prime in `[lower, upper)`.
#[must_use]
pub fn primes_in_range(lower: u32, upper: u32) -> Vec<u16> {
    (lower..upper.min(PRIME_RANGE_END))
        .filter(|&n| is_prime(n))
        .filter_map(|n| u16::try_from(n).ok())
        .collect()
}

/// Every prime in `[PRIME_RANGE_START, PRIME_RANGE_END)`, computed once.
#[must_use]
pub fn default_primes() -> &'static [u16] {
    &DEFAULT_PRIMES
}

/// Picks a prime uniformly among those in `[lower, upper)`.
///
/// The default range reuses [`default_primes`]; any other range is
/// searched on each call.
///
/// # Errors
///
/// Returns [`KeyAgreementError::NoPrimeInRange`] when the range holds no
/// prime.
pub fn generate_prime<R: Rng + ?Sized>(
    rng: &mut R,
    lower: u32,
    upper: u32,
) -> Result<u16, KeyAgreementError> {
    let (lower, upper) = if lower > upper {
        (upper, lower)
    } else {
        (lower, upper)
    };
    let searched;
    let primes: &[u16] = if (lower, upper) == (PRIME_RANGE_START, PRIME_RANGE_END) {
        default_primes()
    } else {
        searched = primes_in_range(lower, upper);
        &searched
    };
    if primes.is_empty() {
        return Err(KeyAgreementError::NoPrimeInRange { lower, upper });
    }
    Ok(primes[rng.gen_range(0..primes.len())])
}

/// One side's view of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeParameters {
    pub modulus: u16,
    pub generator: u16,
    pub private_exponent: u16,
    pub public_value: u16,
}

impl HandshakeParameters {
    /// Derives the public value for `private_exponent` under `modulus`.
    ///
    /// # Errors
    ///
    /// Returns [`KeyAgreementError::InvalidModulus`] for a modulus below 2.
    pub fn new(modulus: u16, private_exponent: u16) -> Result<Self, KeyAgreementError> {
        if modulus < 2 {
            return Err(KeyAgreementError::InvalidModulus(modulus));
        }
        let public = mod_exp(
            u64::from(PRIMITIVE_ROOT),
            u64::from(private_exponent),
            u64::from(modulus),
        )
        .ok_or(KeyAgreementError::InvalidModulus(modulus))?;
        Ok(Self {
            modulus,
            generator: PRIMITIVE_ROOT,
            private_exponent,
            // public < modulus <= u16::MAX
            public_value: u16::try_from(public).unwrap_or_default(),
        })
    }

    /// Derives the shared secret from the peer's public value.
    ///
    /// A zero `modulus` (only reachable by building the struct by hand)
    /// yields a zero secret.
    #[must_use]
    pub fn shared_secret(&self, peer_public: u16) -> SharedSecret {
        SharedSecret(
            mod_exp(
                u64::from(peer_public),
                u64::from(self.private_exponent),
                u64::from(self.modulus),
            )
            .unwrap_or_default(),
        )
    }
}

async fn read_u16<C: Connection>(conn: &mut C) -> Result<u16, SessionError> {
    let mut buf = [0u8; 2];
    conn.read_full(&mut buf).await?;
    Ok(u16::from_ne_bytes(buf))
}

/// Server half: sends the modulus and public value, then reads the
/// client's public value.
///
/// # Errors
///
/// Fails if no prime can be generated or the connection breaks.
pub async fn server_handshake<C, R>(conn: &mut C, rng: &mut R) -> Result<SharedSecret, SessionError>
where
    C: Connection,
    R: Rng + ?Sized,
{
    let modulus = generate_prime(rng, PRIME_RANGE_START, PRIME_RANGE_END)?;
    let params = HandshakeParameters::new(modulus, rng.r#gen())?;

    conn.send_all(&params.modulus.to_ne_bytes()).await?;
    conn.send_all(&params.public_value.to_ne_bytes()).await?;
    let client_public = read_u16(conn).await?;

    debug!(
        modulus = params.modulus,
        public = params.public_value,
        client_public,
        "Server key agreement complete"
    );
    Ok(params.shared_secret(client_public))
}

/// Client half: reads the modulus and server public value, answers with
/// its own public value.
///
/// # Errors
///
/// Fails on a modulus below 2 or if the connection breaks.
pub async fn client_handshake<C, R>(conn: &mut C, rng: &mut R) -> Result<SharedSecret, SessionError>
where
    C: Connection,
    R: Rng + ?Sized,
{
    let modulus = read_u16(conn).await?;
    let server_public = read_u16(conn).await?;
    let params = HandshakeParameters::new(modulus, rng.r#gen())?;

    conn.send_all(&params.public_value.to_ne_bytes()).await?;

    debug!(
        modulus,
        public = params.public_value,
        server_public,
        "Client key agreement complete"
    );
    Ok(params.shared_secret(server_public))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::memory::MemoryConnection;

    #[test]
    fn given_reference_vector_when_exchanging_then_both_sides_derive_39() {
        let (p, g, a, b) = (101, 2, 7, 5);
        let server_public = mod_exp(g, a, p).unwrap();
        let client_public = mod_exp(g, b, p).unwrap();
        assert_eq!(server_public, 27);
        assert_eq!(client_public, 32);
        assert_eq!(mod_exp(client_public, a, p), Some(39));
        assert_eq!(mod_exp(server_public, b, p), Some(39));
    }

    #[test]
    fn given_random_exponents_when_exchanging_then_secrets_agree() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let p = u64::from(generate_prime(&mut rng, 0, 65536).unwrap());
            let g = u64::from(PRIMITIVE_ROOT);
            let a: u64 = rng.gen_range(0..65536);
            let b: u64 = rng.gen_range(0..65536);
            let server_public = mod_exp(g, a, p).unwrap();
            let client_public = mod_exp(g, b, p).unwrap();
            assert_eq!(
                mod_exp(client_public, a, p),
                mod_exp(server_public, b, p),
                "p={p} a={a} b={b}"
            );
        }
    }

    #[test]
    fn given_large_operands_when_exponentiating_then_no_overflow() {
        // 65521 is the largest 16-bit prime; squaring values near it needs > 32 bits.
        let p = 65521;
        assert_eq!(mod_exp(65520, 2, p), Some(1));
        assert_eq!(mod_exp(u64::from(PRIMITIVE_ROOT), 0, p), Some(1));
        // Fermat: a^(p-1) = 1 mod p
        assert_eq!(mod_exp(12345, p - 1, p), Some(1));
        assert_eq!(mod_exp(u64::MAX - 1, 2, u64::MAX), Some(1));
    }

    #[test]
    fn given_modulus_one_when_exponentiating_then_zero() {
        assert_eq!(mod_exp(5, 3, 1), Some(0));
    }

    #[test]
    fn given_zero_modulus_when_exponentiating_then_none() {
        assert_eq!(mod_exp(5, 3, 0), None);
        assert_eq!(mod_exp(0, 0, 0), None);
    }

    #[test]
    fn when_testing_primality_expect_small_cases_correct() {
        let primes: Vec<u32> = (0..30).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
        assert!(is_prime(65521));
        assert!(!is_prime(65535));
    }

    #[test]
    fn given_full_range_when_listing_primes_then_count_matches() {
        assert_eq!(primes_in_range(0, 65536).len(), 6542);
    }

    #[test]
    fn given_default_range_when_listing_twice_then_same_cached_table() {
        let first = default_primes();
        let second = default_primes();
        assert_eq!(first.len(), 6542);
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.last(), Some(&65521));
    }

    #[test]
    fn given_default_range_when_generating_then_prime_from_cached_table() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let p = generate_prime(&mut rng, PRIME_RANGE_START, PRIME_RANGE_END).unwrap();
            assert!(default_primes().binary_search(&p).is_ok());
        }
    }

    #[test]
    fn given_range_without_primes_when_generating_then_error() {
        let mut rng = StdRng::seed_from_u64(1);
        let err = generate_prime(&mut rng, 24, 29).unwrap_err();
        assert_eq!(err, KeyAgreementError::NoPrimeInRange { lower: 24, upper: 29 });
    }

    #[test]
    fn given_reversed_bounds_when_generating_then_bounds_are_swapped() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = generate_prime(&mut rng, 20, 10).unwrap();
        assert!([11, 13, 17, 19].contains(&p));
    }

    #[test]
    fn given_degenerate_modulus_when_building_parameters_then_error() {
        assert_eq!(
            HandshakeParameters::new(0, 3).unwrap_err(),
            KeyAgreementError::InvalidModulus(0)
        );
        assert!(HandshakeParameters::new(1, 3).is_err());
    }

    #[tokio::test]
    async fn given_connected_pair_when_handshaking_then_secrets_match() {
        let (mut server, mut client) = MemoryConnection::pair(64);
        let mut server_rng = StdRng::seed_from_u64(11);
        let mut client_rng = StdRng::seed_from_u64(22);

        let (s, c) = tokio::join!(
            server_handshake(&mut server, &mut server_rng),
            client_handshake(&mut client, &mut client_rng),
        );
        assert_eq!(s.unwrap(), c.unwrap());
    }

    #[tokio::test]
    async fn given_server_sends_zero_modulus_when_client_handshakes_then_handshake_error() {
        let (mut server, mut client) = MemoryConnection::pair(64);
        server.write_all(&0u16.to_ne_bytes()).await.unwrap();
        server.write_all(&0u16.to_ne_bytes()).await.unwrap();

        let mut rng = StdRng::seed_from_u64(3);
        let err = client_handshake(&mut client, &mut rng).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Handshake(KeyAgreementError::InvalidModulus(0))
        ));
    }

    #[tokio::test]
    async fn given_client_disconnects_when_server_handshakes_then_connection_closed() {
        let (mut server, client) = MemoryConnection::pair(64);
        drop(client);
        let mut rng = StdRng::seed_from_u64(5);
        let err = server_handshake(&mut server, &mut rng).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(_) | SessionError::ConnectionClosed { .. }
        ));
    }
}
