//! Deterministic key chains.
//!
//! The wallet only ever holds the account-level *public* key
//! ([`MasterPubKey`], the public half of `m/0'`). Receive and change
//! addresses are derived from it with non-hardened BIP-32 steps
//! (`mpk/chain/index`). Private keys exist only transiently inside
//! [`derive_signing_keys`], reconstructed from the seed at signing time and
//! erased immediately after use.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use thiserror::Error;
use zeroize::Zeroize;

use crate::{address::Address, hashes::hash160};

/// The external (receive) address chain.
pub const CHAIN_EXTERNAL: u32 = 0;
/// The internal (change) address chain.
pub const CHAIN_INTERNAL: u32 = 1;

const BIP32_SEED_KEY: &[u8] = b"Bitcoin seed";
const HARDENED: u32 = 0x8000_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("seed produced an out-of-range key")]
    BadSeed,
    #[error("derivation produced an invalid child key")]
    BadDerivation,
}

/// The public half of the account key `m/0'`, plus its chain code.
///
/// This is all the wallet needs to enumerate addresses; it cannot spend.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MasterPubKey {
    /// First 32 bits of `hash160` of the root public key, for display.
    pub fingerprint: u32,
    pub chain_code: [u8; 32],
    pub pub_key: [u8; 33],
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key)
        .expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// One hardened private derivation step.
fn ckd_priv_hardened(
    secret: &mut SecretKey,
    chain_code: &mut [u8; 32],
    index: u32,
) -> Result<(), KeyError> {
    let mut data = Vec::with_capacity(37);
    data.push(0u8);
    data.extend_from_slice(&secret.secret_bytes());
    data.extend_from_slice(&(index | HARDENED).to_be_bytes());

    let mut i = hmac_sha512(chain_code, &data);
    data.zeroize();

    let tweak = Scalar::from_be_bytes(i[..32].try_into().unwrap())
        .map_err(|_| KeyError::BadDerivation)?;
    *secret = secret
        .add_tweak(&tweak)
        .map_err(|_| KeyError::BadDerivation)?;
    chain_code.copy_from_slice(&i[32..]);
    i.zeroize();
    Ok(())
}

/// One non-hardened private derivation step.
fn ckd_priv(
    secp: &Secp256k1<secp256k1::All>,
    secret: &mut SecretKey,
    chain_code: &mut [u8; 32],
    index: u32,
) -> Result<(), KeyError> {
    let pubkey = PublicKey::from_secret_key(secp, secret);
    let mut data = Vec::with_capacity(37);
    data.extend_from_slice(&pubkey.serialize());
    data.extend_from_slice(&index.to_be_bytes());

    let mut i = hmac_sha512(chain_code, &data);
    let tweak = Scalar::from_be_bytes(i[..32].try_into().unwrap())
        .map_err(|_| KeyError::BadDerivation)?;
    *secret = secret
        .add_tweak(&tweak)
        .map_err(|_| KeyError::BadDerivation)?;
    chain_code.copy_from_slice(&i[32..]);
    i.zeroize();
    Ok(())
}

/// One non-hardened public derivation step.
fn ckd_pub(
    secp: &Secp256k1<secp256k1::All>,
    pubkey: &mut PublicKey,
    chain_code: &mut [u8; 32],
    index: u32,
) -> Result<(), KeyError> {
    let mut data = Vec::with_capacity(37);
    data.extend_from_slice(&pubkey.serialize());
    data.extend_from_slice(&index.to_be_bytes());

    let i = hmac_sha512(chain_code, &data);
    let tweak = Scalar::from_be_bytes(i[..32].try_into().unwrap())
        .map_err(|_| KeyError::BadDerivation)?;
    *pubkey = pubkey
        .add_exp_tweak(secp, &tweak)
        .map_err(|_| KeyError::BadDerivation)?;
    chain_code.copy_from_slice(&i[32..]);
    Ok(())
}

/// Derives the root key from a seed, returning `(secret, chain_code,
/// fingerprint)`. The caller owns erasure of the secret.
fn master_from_seed(
    seed: &[u8],
) -> Result<(SecretKey, [u8; 32], u32), KeyError> {
    let mut i = hmac_sha512(BIP32_SEED_KEY, seed);
    let secret =
        SecretKey::from_slice(&i[..32]).map_err(|_| KeyError::BadSeed)?;
    let chain_code: [u8; 32] = i[32..].try_into().unwrap();
    i.zeroize();

    let secp = Secp256k1::new();
    let root_pub = PublicKey::from_secret_key(&secp, &secret);
    let fingerprint =
        u32::from_be_bytes(hash160(&root_pub.serialize())[..4].try_into().unwrap());

    Ok((secret, chain_code, fingerprint))
}

impl MasterPubKey {
    /// Derives the account public key `m/0'` from a wallet seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let (mut secret, mut chain_code, fingerprint) =
            master_from_seed(seed)?;
        let result = ckd_priv_hardened(&mut secret, &mut chain_code, 0);

        let mpk = result.map(|()| {
            let secp = Secp256k1::new();
            Self {
                fingerprint,
                chain_code,
                pub_key: PublicKey::from_secret_key(&secp, &secret).serialize(),
            }
        });
        secret.non_secure_erase();
        mpk
    }

    /// The serialized public key at `mpk/chain/index`.
    pub fn derive_pubkey(
        &self,
        chain: u32,
        index: u32,
    ) -> Result<[u8; 33], KeyError> {
        let secp = Secp256k1::new();
        let mut pubkey = PublicKey::from_slice(&self.pub_key)
            .map_err(|_| KeyError::BadDerivation)?;
        let mut chain_code = self.chain_code;
        ckd_pub(&secp, &mut pubkey, &mut chain_code, chain)?;
        ckd_pub(&secp, &mut pubkey, &mut chain_code, index)?;
        Ok(pubkey.serialize())
    }

    /// The address at `mpk/chain/index`. Deterministic in `(chain, index)`.
    pub fn derive_address(
        &self,
        chain: u32,
        index: u32,
    ) -> Result<Address, KeyError> {
        Ok(Address::from_pubkey(&self.derive_pubkey(chain, index)?))
    }
}

/// A transient signing key: the secret plus its precomputed address.
pub struct SigningKey {
    secret: SecretKey,
    pub address: Address,
}

impl SigningKey {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let address = Address::from_pubkey(
            &PublicKey::from_secret_key(&secp, &secret).serialize(),
        );
        Self { secret, address }
    }

    pub fn pubkey(&self) -> [u8; 33] {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &self.secret).serialize()
    }

    /// DER-encoded ECDSA signature over a 32-byte digest.
    pub fn sign(&self, digest: [u8; 32]) -> Vec<u8> {
        let secp = Secp256k1::new();
        let msg = secp256k1::Message::from_digest(digest);
        secp.sign_ecdsa(&msg, &self.secret)
            .serialize_der()
            .to_vec()
    }

    /// Best-effort key erasure. Also runs on drop.
    pub fn erase(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.erase();
    }
}

/// Reconstructs the signing keys for `mpk/chain/<index>` from the seed.
/// Intermediate secrets are erased before returning.
pub fn derive_signing_keys(
    seed: &[u8],
    chain: u32,
    indexes: &[u32],
) -> Result<Vec<SigningKey>, KeyError> {
    let secp = Secp256k1::new();
    let (mut account, mut account_cc, _fingerprint) = master_from_seed(seed)?;

    let result = (|| {
        ckd_priv_hardened(&mut account, &mut account_cc, 0)?;
        ckd_priv(&secp, &mut account, &mut account_cc, chain)?;

        let mut keys = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let mut child = account;
            let mut child_cc = account_cc;
            ckd_priv(&secp, &mut child, &mut child_cc, index)?;
            keys.push(SigningKey::new(child));
        }
        Ok(keys)
    })();

    account.non_secure_erase();
    account_cc.zeroize();
    result
}
