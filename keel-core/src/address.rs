use std::fmt::{self, Display};

use crate::{
    hashes::hash160,
    script::{
        self, Element, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY,
        OP_HASH160,
    },
};

/// Base58check version byte for pay-to-pubkey-hash addresses.
pub const PUBKEY_ADDRESS_PREFIX: u8 = 0x30;
/// Base58check version byte for pay-to-script-hash addresses.
pub const SCRIPT_ADDRESS_PREFIX: u8 = 0x32;

/// A textual base58check address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address for a serialized (compressed or uncompressed) public key.
    pub fn from_pubkey(pubkey: &[u8]) -> Self {
        Self::from_pubkey_hash(hash160(pubkey))
    }

    pub fn from_pubkey_hash(hash: [u8; 20]) -> Self {
        Self(
            bs58::encode(hash)
                .with_check_version(PUBKEY_ADDRESS_PREFIX)
                .into_string(),
        )
    }

    pub fn from_script_hash(hash: [u8; 20]) -> Self {
        Self(
            bs58::encode(hash)
                .with_check_version(SCRIPT_ADDRESS_PREFIX)
                .into_string(),
        )
    }

    /// Recognizes the standard output script templates:
    /// pay-to-pubkey-hash, pay-to-script-hash, and pay-to-pubkey.
    pub fn from_script_pubkey(script: &[u8]) -> Option<Self> {
        match script::elements(script).as_slice() {
            [Element::Op(OP_DUP), Element::Op(OP_HASH160), Element::Push(hash), Element::Op(OP_EQUALVERIFY), Element::Op(OP_CHECKSIG)]
                if hash.len() == 20 =>
                Some(Self::from_pubkey_hash((*hash).try_into().unwrap())),
            [Element::Op(OP_HASH160), Element::Push(hash), Element::Op(OP_EQUAL)]
                if hash.len() == 20 =>
                Some(Self::from_script_hash((*hash).try_into().unwrap())),
            [Element::Push(pubkey), Element::Op(OP_CHECKSIG)]
                if pubkey.len() == 33 || pubkey.len() == 65 =>
                Some(Self::from_pubkey(pubkey)),
            _ => None,
        }
    }

    /// Recovers the sender address from a pay-to-pubkey-hash input script
    /// (`<sig> <pubkey>`).
    pub fn from_script_sig(script: &[u8]) -> Option<Self> {
        match script::elements(script).as_slice() {
            [.., Element::Push(_sig), Element::Push(pubkey)]
                if pubkey.len() == 33 || pubkey.len() == 65 =>
                Some(Self::from_pubkey(pubkey)),
            _ => None,
        }
    }

    /// The scriptPubKey paying to this address, or `None` if the address
    /// fails its checksum.
    pub fn script_pubkey(&self) -> Option<Vec<u8>> {
        let payload = bs58::decode(&self.0).with_check(None).into_vec().ok()?;
        let (&version, hash) = payload.split_first()?;
        if hash.len() != 20 {
            return None;
        }

        let mut out = Vec::with_capacity(25);
        match version {
            PUBKEY_ADDRESS_PREFIX => {
                out.extend_from_slice(&[OP_DUP, OP_HASH160]);
                script::push_data(&mut out, hash);
                out.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            }
            SCRIPT_ADDRESS_PREFIX => {
                out.push(OP_HASH160);
                script::push_data(&mut out, hash);
                out.push(OP_EQUAL);
            }
            _ => return None,
        }
        Some(out)
    }

    /// The 20-byte hash embedded in the address, if the checksum holds.
    pub fn hash160(&self) -> Option<[u8; 20]> {
        let payload = bs58::decode(&self.0).with_check(None).into_vec().ok()?;
        payload.get(1..21)?.try_into().ok()
    }

    pub fn is_valid(&self) -> bool {
        bs58::decode(&self.0)
            .with_check(None)
            .into_vec()
            .ok()
            .and_then(|payload| {
                let (&version, hash) = payload.split_first()?;
                Some(
                    hash.len() == 20
                        && (version == PUBKEY_ADDRESS_PREFIX
                            || version == SCRIPT_ADDRESS_PREFIX),
                )
            })
            .unwrap_or(false)
    }

    /// Wraps an arbitrary string. Use [`Address::is_valid`] before trusting
    /// externally supplied input.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pubkey_hash_round_trips_through_script() {
        let addr = Address::from_pubkey_hash([7u8; 20]);
        assert!(addr.is_valid());

        let script = addr.script_pubkey().unwrap();
        assert_eq!(script.len(), 25);
        assert_eq!(Address::from_script_pubkey(&script), Some(addr.clone()));
        assert_eq!(addr.hash160(), Some([7u8; 20]));
    }

    #[test]
    fn script_hash_round_trips_through_script() {
        let addr = Address::from_script_hash([9u8; 20]);
        let script = addr.script_pubkey().unwrap();
        assert_eq!(script.len(), 23);
        assert_eq!(Address::from_script_pubkey(&script), Some(addr));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(!Address::from_string("notbase58check".to_owned()).is_valid());
        assert_eq!(
            Address::from_string("notbase58check".to_owned()).script_pubkey(),
            None
        );
    }

    #[test]
    fn sender_recovery_from_script_sig() {
        let pubkey = [2u8; 33];
        let mut script_sig = Vec::new();
        script::push_data(&mut script_sig, &[1u8; 71]); // dummy signature
        script::push_data(&mut script_sig, &pubkey);

        assert_eq!(
            Address::from_script_sig(&script_sig),
            Some(Address::from_pubkey(&pubkey))
        );
    }
}
