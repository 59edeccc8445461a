use openssl::bn::{BigNum, BigNumContext, BigNumRef};
use serde::{Deserialize, Serialize};

use crate::{
    bigint::BigInt,
    error::{Error, Result},
};

/// Smallest group size we are willing to generate.
const MIN_KEYBITS: u32 = 16;

/// A multiplicative group modulo a safe prime `p = 2q + 1`, generated by `g`,
/// an element of the order-`q` subgroup of quadratic residues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub p: BigInt,
    pub g: BigInt,
}

impl Group {
    /// Generates a fresh group with a `bits`-bit safe prime modulus.
    pub fn generate(bits: u32) -> Result<Self> {
        if bits < MIN_KEYBITS {
            return Err(Error::KeySizeTooSmall {
                bits,
                min: MIN_KEYBITS,
            });
        }

        let mut ctx = BigNumContext::new()?;
        let mut p = BigNum::new()?;
        p.generate_prime(bits as i32, true, None, None)?;

        // h in [2, p - 1), g = h^2 lands in the quadratic residues
        let one = BigNum::from_u32(1)?;
        let two = BigNum::from_u32(2)?;
        let range = &p - &BigNum::from_u32(3)?;
        let g = loop {
            let mut h = BigNum::new()?;
            range.rand_range(&mut h)?;
            let h = &h + &two;
            let mut g = BigNum::new()?;
            g.mod_exp(&h, &two, &p, &mut ctx)?;
            if g != one {
                break g;
            }
        };

        Ok(Self {
            p: p.into(),
            g: g.into(),
        })
    }

    /// The order of the subgroup generated by `g`, `q = (p - 1) / 2`.
    pub fn q(&self) -> Result<BigNum> {
        let mut q = BigNum::new()?;
        q.rshift1(self.p.as_bn())?;
        Ok(q)
    }

    /// A uniformly random exponent in `[1, q)`.
    fn random_exponent(&self) -> Result<BigNum> {
        let q = self.q()?;
        let range = &q - &BigNum::from_u32(1)?;
        let mut r = BigNum::new()?;
        range.rand_range(&mut r)?;
        Ok(&r + &BigNum::from_u32(1)?)
    }

    fn pow(
        &self,
        base: &BigNumRef,
        exponent: &BigNumRef,
        ctx: &mut BigNumContext,
    ) -> Result<BigNum> {
        let mut result = BigNum::new()?;
        result.mod_exp(base, exponent, self.p.as_bn(), ctx)?;
        Ok(result)
    }

    fn mul(&self, a: &BigNumRef, b: &BigNumRef, ctx: &mut BigNumContext) -> Result<BigNum> {
        let mut result = BigNum::new()?;
        result.mod_mul(a, b, self.p.as_bn(), ctx)?;
        Ok(result)
    }

    fn inverse(&self, a: &BigNumRef, ctx: &mut BigNumContext) -> Result<BigNum> {
        let mut result = BigNum::new()?;
        result.mod_inverse(a, self.p.as_bn(), ctx)?;
        Ok(result)
    }
}

/// An ElGamal public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub p: BigInt,
    pub g: BigInt,
    pub y: BigInt,
}

/// An ElGamal ciphertext, `(g^r, m * y^r)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ciphertext {
    pub a: BigInt,
    pub b: BigInt,
}

impl PublicKey {
    /// Builds a public key from its components.
    pub fn construct((p, g, y): (BigInt, BigInt, BigInt)) -> Self {
        Self { p, g, y }
    }

    pub fn group(&self) -> Group {
        Group {
            p: self.p.clone(),
            g: self.g.clone(),
        }
    }

    /// Encrypts `message`, which must lie in `[1, p)`.
    pub fn encrypt(&self, message: &BigInt) -> Result<Ciphertext> {
        if message.num_bits() == 0 || message >= &self.p {
            return Err(Error::MessageOutOfRange(message.to_string()));
        }

        let group = self.group();
        let mut ctx = BigNumContext::new()?;
        let r = group.random_exponent()?;
        let a = group.pow(self.g.as_bn(), &r, &mut ctx)?;
        let s = group.pow(self.y.as_bn(), &r, &mut ctx)?;
        let b = group.mul(message.as_bn(), &s, &mut ctx)?;

        Ok(Ciphertext {
            a: a.into(),
            b: b.into(),
        })
    }

    pub fn encrypt_u64(&self, message: u64) -> Result<Ciphertext> {
        self.encrypt(&BigInt::from_u64(message)?)
    }

    /// Checks that both halves of `ciphertext` lie in `[1, p)`. Anything else
    /// cannot have come from [`PublicKey::encrypt`] and has no inverse to
    /// decrypt with.
    pub fn check_ciphertext(&self, ciphertext: &Ciphertext) -> Result<()> {
        let in_group =
            |value: &BigInt| value.num_bits() > 0 && !value.is_negative() && value < &self.p;
        if in_group(&ciphertext.a) && in_group(&ciphertext.b) {
            Ok(())
        } else {
            Err(Error::CiphertextOutOfRange)
        }
    }

    /// Re-randomizes `ciphertext` without changing the plaintext it hides.
    pub fn reencrypt(&self, ciphertext: &Ciphertext) -> Result<Ciphertext> {
        let group = self.group();
        let mut ctx = BigNumContext::new()?;
        let r = group.random_exponent()?;
        let gr = group.pow(self.g.as_bn(), &r, &mut ctx)?;
        let yr = group.pow(self.y.as_bn(), &r, &mut ctx)?;

        Ok(Ciphertext {
            a: group.mul(ciphertext.a.as_bn(), &gr, &mut ctx)?.into(),
            b: group.mul(ciphertext.b.as_bn(), &yr, &mut ctx)?.into(),
        })
    }
}

impl Ciphertext {
    /// Homomorphic product: the result decrypts to the product of the two
    /// plaintexts modulo `p`.
    pub fn mul(&self, other: &Ciphertext, public_key: &PublicKey) -> Result<Ciphertext> {
        let group = public_key.group();
        let mut ctx = BigNumContext::new()?;
        Ok(Ciphertext {
            a: group.mul(self.a.as_bn(), other.a.as_bn(), &mut ctx)?.into(),
            b: group.mul(self.b.as_bn(), other.b.as_bn(), &mut ctx)?.into(),
        })
    }
}

/// An ElGamal key pair. Serializes flat as `{p, g, y, x}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(flatten)]
    pub public: PublicKey,
    pub x: BigInt,
}

impl KeyPair {
    /// Generates a key pair within `group`.
    pub fn generate(group: &Group) -> Result<Self> {
        let mut ctx = BigNumContext::new()?;
        let x = group.random_exponent()?;
        let y = group.pow(group.g.as_bn(), &x, &mut ctx)?;

        Ok(Self {
            public: PublicKey {
                p: group.p.clone(),
                g: group.g.clone(),
                y: y.into(),
            },
            x: x.into(),
        })
    }

    pub fn from_parts(p: BigInt, g: BigInt, y: BigInt, x: BigInt) -> Self {
        Self {
            public: PublicKey { p, g, y },
            x,
        }
    }

    fn shared_secret_inverse(
        &self,
        ciphertext: &Ciphertext,
        ctx: &mut BigNumContext,
    ) -> Result<BigNum> {
        let group = self.public.group();
        let s = group.pow(ciphertext.a.as_bn(), self.x.as_bn(), ctx)?;
        group.inverse(&s, ctx)
    }

    pub fn decrypt(&self, ciphertext: &Ciphertext) -> Result<BigInt> {
        let mut ctx = BigNumContext::new()?;
        let s_inv = self.shared_secret_inverse(ciphertext, &mut ctx)?;
        Ok(self
            .public
            .group()
            .mul(ciphertext.b.as_bn(), &s_inv, &mut ctx)?
            .into())
    }

    /// Removes this key's share from a ciphertext encrypted under a combined
    /// key. `a` is left untouched so later shares can still be removed.
    pub fn partial_decrypt(&self, ciphertext: &Ciphertext) -> Result<Ciphertext> {
        Ok(Ciphertext {
            a: ciphertext.a.clone(),
            b: self.decrypt(ciphertext)?,
        })
    }
}

/// Combines the public keys of several authorities into the key votes are
/// encrypted against. All keys must share `(p, g)`.
pub fn combine_public_keys(keys: &[PublicKey]) -> Result<PublicKey> {
    let (first, rest) = keys.split_first().ok_or(Error::NoAuthorities)?;
    let group = first.group();
    let mut ctx = BigNumContext::new()?;
    let mut y = first.y.clone().into_bn();

    for key in rest {
        if key.p != first.p || key.g != first.g {
            return Err(Error::GroupMismatch);
        }
        y = group.mul(&y, key.y.as_bn(), &mut ctx)?;
    }

    Ok(PublicKey {
        p: group.p,
        g: group.g,
        y: y.into(),
    })
}
