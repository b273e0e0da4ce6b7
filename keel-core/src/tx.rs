use rand_core::RngCore;
use thiserror::Error;

use crate::{
    address::Address,
    constants::{
        SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_FORKID, SIGHASH_NONE,
        SIGHASH_SINGLE, TX_FEE_PER_KB, TX_INPUT_SIZE, TX_UNCONFIRMED,
    },
    hashes::{sha256d, TxId},
    keys::SigningKey,
    rng,
    script::{self, Element, OP_EQUALVERIFY},
    varint,
};

const TX_VERSION: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxParseError {
    #[error("serialized tx truncated")]
    Truncated,
    #[error("tx has no inputs")]
    NoInputs,
    #[error("bad varint: {0}")]
    BadVarInt(#[from] varint::DecodeError),
}

/// A transaction input.
///
/// `script` holds the *previous output's* scriptPubKey when known (required
/// for signing); `signature` holds this input's scriptSig. `amount` is the
/// value of the previous output, or 0 when unknown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prev_hash: TxId,
    pub prev_index: u32,
    pub amount: u64,
    pub script: Vec<u8>,
    pub signature: Vec<u8>,
    pub sequence: u32,
    /// Derived from `script` if present, else recovered from `signature`.
    pub address: Option<Address>,
}

impl TxIn {
    pub fn new(
        prev_hash: TxId,
        prev_index: u32,
        amount: u64,
        script: Vec<u8>,
        signature: Vec<u8>,
        sequence: u32,
    ) -> Self {
        let address = Address::from_script_pubkey(&script)
            .or_else(|| Address::from_script_sig(&signature));
        Self {
            prev_hash,
            prev_index,
            amount,
            script,
            signature,
            sequence,
            address,
        }
    }

    /// Installs a scriptSig, re-deriving the address if it wasn't known.
    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = signature;
        if self.address.is_none() {
            self.address = Address::from_script_sig(&self.signature);
        }
    }

    fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Serializes this input. `amount` is only written when non-zero; the
    /// unsigned round-trip format and the BIP-143 digest both rely on this.
    fn write(
        &self,
        buf: &mut Vec<u8>,
        sig: &[u8],
        amount: u64,
        sequence: u32,
    ) {
        buf.extend_from_slice(&self.prev_hash.0);
        buf.extend_from_slice(&self.prev_index.to_le_bytes());
        varint::write(buf, sig.len() as u64);
        buf.extend_from_slice(sig);
        if amount != 0 {
            buf.extend_from_slice(&amount.to_le_bytes());
        }
        buf.extend_from_slice(&sequence.to_le_bytes());
    }
}

/// A transaction output: an amount and the script that locks it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub amount: u64,
    pub script: Vec<u8>,
    /// Derived from `script` when it matches a standard template.
    pub address: Option<Address>,
}

impl TxOut {
    pub fn new(amount: u64, script: Vec<u8>) -> Self {
        let address = Address::from_script_pubkey(&script);
        Self {
            amount,
            script,
            address,
        }
    }

    pub fn to_address(amount: u64, address: &Address) -> Option<Self> {
        let script = address.script_pubkey()?;
        Some(Self {
            amount,
            script,
            address: Some(address.clone()),
        })
    }

    fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.amount.to_le_bytes());
        varint::write(buf, self.script.len() as u64);
        buf.extend_from_slice(&self.script);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    /// Valid once the tx is fully signed (or parsed in signed form).
    pub txid: TxId,
    /// `TX_UNCONFIRMED` until the tx lands in a verified block.
    pub block_height: u32,
    pub timestamp: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            version: TX_VERSION,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            txid: TxId::ZERO,
            block_height: TX_UNCONFIRMED,
            timestamp: 0,
        }
    }

    pub fn add_input(&mut self, input: TxIn) {
        self.inputs.push(input);
    }

    pub fn add_output(&mut self, output: TxOut) {
        self.outputs.push(output);
    }

    /// True if every input carries a scriptSig. Does not verify them.
    pub fn is_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(TxIn::is_signed)
    }

    /// Canonical serialization. Unsigned inputs round-trip their previous
    /// output script and amount in place of a scriptSig.
    pub fn serialize(&self) -> Vec<u8> {
        self.sighash_data(None, SIGHASH_ALL)
    }

    /// The byte string hashed for the signature of input `index`.
    /// With `SIGHASH_FORKID` set this is the BIP-143 digest preimage,
    /// otherwise the legacy one. `index: None` yields the full transaction.
    fn sighash_data(&self, index: Option<usize>, hash_type: u32) -> Vec<u8> {
        if hash_type & SIGHASH_FORKID != 0 {
            if let Some(index) = index {
                return self.witness_data(index, hash_type);
            }
        }

        let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
        let sig_hash = hash_type & 0x1f;
        let mut buf = Vec::with_capacity(self.size());

        buf.extend_from_slice(&self.version.to_le_bytes());

        if !anyone_can_pay {
            varint::write(&mut buf, self.inputs.len() as u64);
            for (i, input) in self.inputs.iter().enumerate() {
                match index {
                    // The input being signed commits to its prior script.
                    Some(signing) if signing == i =>
                        input.write(&mut buf, &input.script, 0, input.sequence),
                    // Other inputs are blanked during digesting; NONE/SINGLE
                    // also zero their sequence so they can be replaced.
                    Some(_) => {
                        let sequence = if sig_hash == SIGHASH_NONE
                            || sig_hash == SIGHASH_SINGLE
                        {
                            0
                        } else {
                            input.sequence
                        };
                        input.write(&mut buf, &[], 0, sequence)
                    }
                    // Full serialization: unsigned inputs keep their script
                    // and amount so an unsigned tx round-trips.
                    None if !input.is_signed() => input.write(
                        &mut buf,
                        &input.script,
                        input.amount,
                        input.sequence,
                    ),
                    None => input.write(
                        &mut buf,
                        &input.signature,
                        0,
                        input.sequence,
                    ),
                }
            }
        } else {
            let input = &self.inputs[index.expect("anyone-can-pay digests a single input")];
            varint::write(&mut buf, 1);
            input.write(&mut buf, &input.script, 0, input.sequence);
        }

        if sig_hash != SIGHASH_NONE && sig_hash != SIGHASH_SINGLE {
            varint::write(&mut buf, self.outputs.len() as u64);
            for output in &self.outputs {
                output.write(&mut buf);
            }
        } else if sig_hash == SIGHASH_SINGLE
            && index.is_some_and(|i| i < self.outputs.len())
        {
            let index = index.unwrap();
            varint::write(&mut buf, index as u64 + 1);
            for _ in 0..index {
                buf.extend_from_slice(&u64::MAX.to_le_bytes());
                varint::write(&mut buf, 0);
            }
            self.outputs[index].write(&mut buf);
        } else {
            varint::write(&mut buf, 0);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        if index.is_some() {
            buf.extend_from_slice(&hash_type.to_le_bytes());
        }
        buf
    }

    /// BIP-143 digest preimage for input `index`.
    fn witness_data(&self, index: usize, hash_type: u32) -> Vec<u8> {
        let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
        let sig_hash = hash_type & 0x1f;
        let mut buf = Vec::new();

        buf.extend_from_slice(&self.version.to_le_bytes());

        // hashPrevouts
        if !anyone_can_pay {
            let mut prevouts = Vec::with_capacity(36 * self.inputs.len());
            for input in &self.inputs {
                prevouts.extend_from_slice(&input.prev_hash.0);
                prevouts.extend_from_slice(&input.prev_index.to_le_bytes());
            }
            buf.extend_from_slice(&sha256d(&prevouts));
        } else {
            buf.extend_from_slice(&[0u8; 32]);
        }

        // hashSequence
        if !anyone_can_pay
            && sig_hash != SIGHASH_SINGLE
            && sig_hash != SIGHASH_NONE
        {
            let mut sequences = Vec::with_capacity(4 * self.inputs.len());
            for input in &self.inputs {
                sequences.extend_from_slice(&input.sequence.to_le_bytes());
            }
            buf.extend_from_slice(&sha256d(&sequences));
        } else {
            buf.extend_from_slice(&[0u8; 32]);
        }

        // outpoint + scriptCode + amount + sequence of the signed input
        let input = &self.inputs[index];
        input.write(&mut buf, &input.script, input.amount, input.sequence);

        // hashOutputs
        if sig_hash != SIGHASH_SINGLE && sig_hash != SIGHASH_NONE {
            let mut outputs = Vec::new();
            for output in &self.outputs {
                output.write(&mut outputs);
            }
            buf.extend_from_slice(&sha256d(&outputs));
        } else if sig_hash == SIGHASH_SINGLE && index < self.outputs.len() {
            let mut single = Vec::new();
            self.outputs[index].write(&mut single);
            buf.extend_from_slice(&sha256d(&single));
        } else {
            buf.extend_from_slice(&[0u8; 32]);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf.extend_from_slice(&hash_type.to_le_bytes());
        buf
    }

    /// Adds signatures to any unsigned inputs whose prior output script
    /// matches one of `keys`. Returns true if the tx ended up fully signed,
    /// in which case `txid` has been recomputed.
    ///
    /// `fork_id` is 0 for bitcoin; forks that set `SIGHASH_FORKID` pass
    /// their fork id to select the BIP-143 digest.
    pub fn sign(&mut self, fork_id: u32, keys: &[SigningKey]) -> bool {
        for i in 0..self.inputs.len() {
            let Some(address) =
                Address::from_script_pubkey(&self.inputs[i].script)
            else {
                continue;
            };
            let Some(key) = keys.iter().find(|k| k.address == address) else {
                continue;
            };

            let hash_type = fork_id | SIGHASH_ALL;
            let digest =
                sha256d(&self.sighash_data(Some(i), hash_type));
            let mut sig = key.sign(digest);
            sig.push(hash_type as u8);

            let elems = script::elements(&self.inputs[i].script);
            let pay_to_pubkey_hash = elems.len() >= 2
                && matches!(elems[elems.len() - 2], Element::Op(OP_EQUALVERIFY));

            let mut script_sig = Vec::with_capacity(sig.len() + 35);
            script::push_data(&mut script_sig, &sig);
            if pay_to_pubkey_hash {
                script::push_data(&mut script_sig, &key.pubkey());
            }
            self.inputs[i].set_signature(script_sig);
        }

        if self.is_signed() {
            self.txid = TxId(sha256d(&self.sighash_data(None, 0)));
            true
        } else {
            false
        }
    }

    /// Parses a serialized transaction. Fails on truncation or zero inputs.
    /// A signed tx gets its `txid` computed over the consumed bytes.
    pub fn parse(buf: &[u8]) -> Result<Self, TxParseError> {
        let mut r = Reader { buf, off: 0 };
        let mut tx = Self::new();
        let mut signed = true;

        tx.version = r.u32_le()?;
        let in_count = r.varint()? as usize;
        if in_count == 0 {
            return Err(TxParseError::NoInputs);
        }

        for _ in 0..in_count {
            let prev_hash = TxId(r.hash()?);
            let prev_index = r.u32_le()?;
            let script_len = r.varint()? as usize;
            let script_bytes = r.bytes(script_len)?.to_vec();

            // A scriptSig never parses as a standard output script; if this
            // one does, it's the unsigned round-trip form and the previous
            // output's amount follows.
            let (script, signature, amount) =
                if Address::from_script_pubkey(&script_bytes).is_some() {
                    signed = false;
                    (script_bytes, Vec::new(), r.u64_le()?)
                } else {
                    (Vec::new(), script_bytes, 0)
                };

            let sequence = r.u32_le()?;
            tx.add_input(TxIn::new(
                prev_hash, prev_index, amount, script, signature, sequence,
            ));
        }

        let out_count = r.varint()? as usize;
        for _ in 0..out_count {
            let amount = r.u64_le()?;
            let script_len = r.varint()? as usize;
            let script = r.bytes(script_len)?.to_vec();
            tx.add_output(TxOut::new(amount, script));
        }

        tx.lock_time = r.u32_le()?;

        if signed {
            tx.txid = TxId(sha256d(&buf[..r.off]));
        }
        Ok(tx)
    }

    /// Size in bytes if signed, or an estimate assuming compact pubkey
    /// signatures otherwise.
    pub fn size(&self) -> usize {
        let mut size = 8
            + varint::size(self.inputs.len() as u64)
            + varint::size(self.outputs.len() as u64);

        for input in &self.inputs {
            size += if input.is_signed() {
                32 + 4
                    + varint::size(input.signature.len() as u64)
                    + input.signature.len()
                    + 4
            } else {
                TX_INPUT_SIZE
            };
        }

        for output in &self.outputs {
            size += 8
                + varint::size(output.script.len() as u64)
                + output.script.len();
        }

        size
    }

    /// Minimum fee needed for this tx to relay across the network.
    pub fn standard_fee(&self) -> u64 {
        (self.size() as u64).div_ceil(1000) * TX_FEE_PER_KB
    }

    /// Fisher-Yates shuffle of the outputs, so change position leaks nothing.
    pub fn shuffle_outputs<R: RngCore>(&mut self, rng: &mut R) {
        for i in 0..self.outputs.len().saturating_sub(1) {
            let remaining = (self.outputs.len() - i) as u32;
            let j = i + rng::next_upto(rng, remaining) as usize;
            self.outputs.swap(i, j);
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl Reader<'_> {
    fn bytes(&mut self, len: usize) -> Result<&[u8], TxParseError> {
        let slice = self
            .buf
            .get(self.off..self.off + len)
            .ok_or(TxParseError::Truncated)?;
        self.off += len;
        Ok(slice)
    }

    fn u32_le(&mut self) -> Result<u32, TxParseError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64_le(&mut self) -> Result<u64, TxParseError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn hash(&mut self) -> Result<[u8; 32], TxParseError> {
        Ok(self.bytes(32)?.try_into().unwrap())
    }

    fn varint(&mut self) -> Result<u64, TxParseError> {
        let (value, consumed) = varint::read(&self.buf[self.off..])
            .map_err(TxParseError::BadVarInt)?;
        self.off += consumed;
        Ok(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        constants::TXIN_SEQUENCE,
        keys::{derive_signing_keys, CHAIN_EXTERNAL},
        rng::FastRng,
    };

    const SEED: &[u8] = b"keel test seed 000000000000000000";

    fn funded_input(key_addr: &Address, amount: u64) -> TxIn {
        TxIn::new(
            TxId([0x11; 32]),
            0,
            amount,
            key_addr.script_pubkey().unwrap(),
            Vec::new(),
            TXIN_SEQUENCE,
        )
    }

    fn unsigned_tx() -> (Transaction, Vec<SigningKey>) {
        let keys = derive_signing_keys(SEED, CHAIN_EXTERNAL, &[0]).unwrap();
        let mut tx = Transaction::new();
        tx.add_input(funded_input(&keys[0].address, 100_000));
        let dest = Address::from_pubkey_hash([0xee; 20]);
        tx.add_output(TxOut::to_address(90_000, &dest).unwrap());
        (tx, keys)
    }

    #[test]
    fn unsigned_tx_round_trips() {
        let (tx, _keys) = unsigned_tx();
        assert!(!tx.is_signed());

        let parsed = Transaction::parse(&tx.serialize()).unwrap();
        assert!(!parsed.is_signed());
        assert_eq!(parsed.inputs[0].amount, 100_000);
        assert_eq!(parsed.inputs[0].script, tx.inputs[0].script);
        assert_eq!(parsed.outputs[0].amount, 90_000);
    }

    #[test]
    fn signed_tx_round_trips_with_stable_txid() {
        let (mut tx, keys) = unsigned_tx();
        assert!(tx.sign(0, &keys));
        assert!(tx.is_signed());
        assert_ne!(tx.txid, TxId::ZERO);

        let parsed = Transaction::parse(&tx.serialize()).unwrap();
        assert!(parsed.is_signed());
        assert_eq!(parsed.txid, tx.txid);
    }

    #[test]
    fn signing_is_idempotent() {
        let (mut tx, keys) = unsigned_tx();
        assert!(tx.sign(0, &keys));
        let first = tx.clone();
        assert!(tx.sign(0, &keys));
        assert_eq!(tx.txid, first.txid);
        assert_eq!(tx.inputs[0].signature, first.inputs[0].signature);
    }

    #[test]
    fn sign_fails_without_matching_key() {
        let (mut tx, _keys) = unsigned_tx();
        let other = derive_signing_keys(SEED, CHAIN_EXTERNAL, &[9]).unwrap();
        assert!(!tx.sign(0, &other));
        assert!(!tx.is_signed());
    }

    #[test]
    fn forkid_digest_differs_from_legacy() {
        let (tx, _) = unsigned_tx();
        let legacy = tx.sighash_data(Some(0), SIGHASH_ALL);
        let forkid =
            tx.sighash_data(Some(0), SIGHASH_FORKID | SIGHASH_ALL);
        assert_ne!(legacy, forkid);
        // The BIP-143 preimage has fixed layout: 4 + 32 + 32 + outpoint/
        // script/amount/sequence + 32 + 4 + 4.
        let input = &tx.inputs[0];
        let expected_len = 4
            + 32
            + 32
            + (32 + 4 + varint::size(input.script.len() as u64)
                + input.script.len()
                + 8
                + 4)
            + 32
            + 4
            + 4;
        assert_eq!(forkid.len(), expected_len);
    }

    #[test]
    fn parse_rejects_truncated_and_empty() {
        let (mut tx, keys) = unsigned_tx();
        tx.sign(0, &keys);
        let bytes = tx.serialize();
        assert_eq!(
            Transaction::parse(&bytes[..bytes.len() - 1]),
            Err(TxParseError::Truncated),
        );

        // version + zero inputs
        let mut no_inputs = 1u32.to_le_bytes().to_vec();
        no_inputs.push(0);
        assert_eq!(
            Transaction::parse(&no_inputs),
            Err(TxParseError::NoInputs)
        );
    }

    #[test]
    fn size_estimate_covers_signed_size() {
        let (mut tx, keys) = unsigned_tx();
        let estimate = tx.size();
        tx.sign(0, &keys);
        // A compact pubkey input never serializes larger than the estimate.
        assert!(tx.size() <= estimate);
        assert_eq!(tx.size(), tx.serialize().len());
    }

    #[test]
    fn standard_fee_rounds_up_per_kb() {
        let (tx, _) = unsigned_tx();
        assert_eq!(tx.standard_fee(), TX_FEE_PER_KB); // < 1000 bytes
    }

    proptest::proptest! {
        #[test]
        fn unsigned_parse_is_the_inverse_of_serialize(
            amounts in proptest::collection::vec(546u64..u32::MAX as u64, 1..5),
            lock_time in proptest::prelude::any::<u32>(),
        ) {
            let keys = derive_signing_keys(SEED, CHAIN_EXTERNAL, &[0]).unwrap();
            let mut tx = Transaction::new();
            tx.lock_time = lock_time;
            tx.add_input(funded_input(&keys[0].address, 1_000_000));
            for (i, amount) in amounts.iter().enumerate() {
                let dest = Address::from_pubkey_hash([i as u8; 20]);
                tx.add_output(TxOut::to_address(*amount, &dest).unwrap());
            }

            let parsed = Transaction::parse(&tx.serialize()).unwrap();
            proptest::prop_assert_eq!(&parsed.inputs, &tx.inputs);
            proptest::prop_assert_eq!(&parsed.outputs, &tx.outputs);
            proptest::prop_assert_eq!(parsed.lock_time, tx.lock_time);
        }
    }

    #[test]
    fn shuffle_preserves_outputs() {
        let (mut tx, _) = unsigned_tx();
        for i in 0..4u64 {
            tx.add_output(TxOut::to_address(
                1_000 + i,
                &Address::from_pubkey_hash([i as u8; 20]),
            )
            .unwrap());
        }
        let mut amounts: Vec<u64> =
            tx.outputs.iter().map(|o| o.amount).collect();
        let mut rng = FastRng::from_u64(42);
        tx.shuffle_outputs(&mut rng);
        let mut shuffled: Vec<u64> =
            tx.outputs.iter().map(|o| o.amount).collect();
        amounts.sort_unstable();
        shuffled.sort_unstable();
        assert_eq!(amounts, shuffled);
    }
}
