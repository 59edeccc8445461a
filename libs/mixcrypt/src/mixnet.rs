use rand::{rngs::OsRng, seq::SliceRandom, CryptoRng, Rng};

use crate::{
    bigint::BigInt,
    elgamal::{combine_public_keys, Ciphertext, Group, KeyPair, PublicKey},
    error::{Error, Result},
};

/// Re-encrypts every ciphertext under `public_key` and returns them in a
/// uniformly random order.
pub fn shuffle<R: Rng + CryptoRng + ?Sized>(
    rng: &mut R,
    ciphertexts: &[Ciphertext],
    public_key: &PublicKey,
) -> Result<Vec<Ciphertext>> {
    let mut shuffled = ciphertexts
        .iter()
        .map(|ciphertext| public_key.reencrypt(ciphertext))
        .collect::<Result<Vec<_>>>()?;
    shuffled.shuffle(rng);
    Ok(shuffled)
}

/// A chain of mixing authorities, each holding one share of the voting key.
#[derive(Debug, Clone)]
pub struct Mixnet {
    authorities: Vec<KeyPair>,
}

impl Mixnet {
    /// Builds a mixnet from existing key shares, in chain order.
    pub fn new(authorities: Vec<KeyPair>) -> Result<Self> {
        let first = authorities.first().ok_or(Error::NoAuthorities)?;
        let group = first.public.group();
        if authorities
            .iter()
            .any(|authority| authority.public.group() != group)
        {
            return Err(Error::GroupMismatch);
        }
        Ok(Self { authorities })
    }

    /// Generates `count` fresh key shares in `group`.
    pub fn generate(group: &Group, count: usize) -> Result<Self> {
        let authorities = (0..count)
            .map(|_| KeyPair::generate(group))
            .collect::<Result<Vec<_>>>()?;
        Self::new(authorities)
    }

    pub fn authorities(&self) -> &[KeyPair] {
        &self.authorities
    }

    /// The key voters encrypt against.
    pub fn public_key(&self) -> Result<PublicKey> {
        self.remaining_public_key(0)
    }

    fn remaining_public_key(&self, from: usize) -> Result<PublicKey> {
        let keys = self.authorities[from..]
            .iter()
            .map(|authority| authority.public.clone())
            .collect::<Vec<_>>();
        combine_public_keys(&keys)
    }

    /// Passes the ciphertexts through every authority. Authority `i`
    /// re-encrypts and shuffles under the key still in effect (shares
    /// `i..n`), then strips its own share. What comes out of the last
    /// authority is plaintext, in an order unrelated to the input.
    ///
    /// Fails with [`Error::CiphertextOutOfRange`] before mixing anything if
    /// a ciphertext lies outside the group.
    pub fn shuffle_decrypt(&self, ciphertexts: &[Ciphertext]) -> Result<Vec<BigInt>> {
        let public_key = self.public_key()?;
        for ciphertext in ciphertexts {
            public_key.check_ciphertext(ciphertext)?;
        }

        let mut rng = OsRng;
        let mut current = ciphertexts.to_vec();

        for (position, authority) in self.authorities.iter().enumerate() {
            let remaining = self.remaining_public_key(position)?;
            current = shuffle(&mut rng, &current, &remaining)?
                .iter()
                .map(|ciphertext| authority.partial_decrypt(ciphertext))
                .collect::<Result<Vec<_>>>()?;
        }

        Ok(current.into_iter().map(|ciphertext| ciphertext.b).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazy_static::lazy_static;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    lazy_static! {
        static ref GROUP: Group = Group::generate(96).unwrap();
    }

    fn sorted(values: Vec<BigInt>) -> Vec<u64> {
        let mut values: Vec<u64> = values.iter().map(|v| v.to_u64().unwrap()).collect();
        values.sort_unstable();
        values
    }

    #[test]
    fn test_shuffle_preserves_plaintexts() {
        let key = KeyPair::generate(&GROUP).unwrap();
        let ciphertexts = (2..12)
            .map(|m| key.public.encrypt_u64(m).unwrap())
            .collect::<Vec<_>>();
        let shuffled = shuffle(&mut OsRng, &ciphertexts, &key.public).unwrap();

        assert_eq!(shuffled.len(), ciphertexts.len());
        for ciphertext in &shuffled {
            assert!(!ciphertexts.contains(ciphertext));
        }
        let clear = shuffled
            .iter()
            .map(|c| key.decrypt(c).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(sorted(clear), (2..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_single_authority_mixnet() {
        let mixnet = Mixnet::generate(&GROUP, 1).unwrap();
        let pk = mixnet.public_key().unwrap();
        assert_eq!(pk, mixnet.authorities()[0].public);

        let votes = [2, 3, 3, 5, 2, 2];
        let ciphertexts = votes
            .iter()
            .map(|&m| pk.encrypt_u64(m).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(
            sorted(mixnet.shuffle_decrypt(&ciphertexts).unwrap()),
            vec![2, 2, 2, 3, 3, 5]
        );
    }

    #[test]
    fn test_mixnet_rejects_ciphertext_outside_group() {
        let mixnet = Mixnet::generate(&GROUP, 1).unwrap();
        let pk = mixnet.public_key().unwrap();
        let forged = Ciphertext {
            a: BigInt::from_u64(0).unwrap(),
            b: BigInt::from_u64(1).unwrap(),
        };

        assert!(matches!(
            mixnet.shuffle_decrypt(&[pk.encrypt_u64(2).unwrap(), forged]),
            Err(Error::CiphertextOutOfRange)
        ));
    }

    #[test]
    fn test_mixnet_requires_authorities() {
        assert!(matches!(Mixnet::new(vec![]), Err(Error::NoAuthorities)));
    }

    #[test]
    fn test_mixnet_rejects_mixed_groups() {
        let other_group = Group::generate(64).unwrap();
        let authorities = vec![
            KeyPair::generate(&GROUP).unwrap(),
            KeyPair::generate(&other_group).unwrap(),
        ];
        assert!(matches!(
            Mixnet::new(authorities),
            Err(Error::GroupMismatch)
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_multi_authority_mixnet(
            authorities in 1usize..4,
            votes in proptest::collection::vec(2u64..8, 0..12),
        ) {
            let mixnet = Mixnet::generate(&GROUP, authorities).unwrap();
            let pk = mixnet.public_key().unwrap();
            let ciphertexts = votes
                .iter()
                .map(|&m| pk.encrypt_u64(m).unwrap())
                .collect::<Vec<_>>();

            let mut expected = votes.clone();
            expected.sort_unstable();
            prop_assert_eq!(sorted(mixnet.shuffle_decrypt(&ciphertexts).unwrap()), expected);
        }
    }
}
