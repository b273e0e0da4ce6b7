use thiserror::Error;

use crate::{
    constants::BLOCK_UNKNOWN_HEIGHT,
    hashes::{sha256d, BlockHash, TxId},
    varint,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MerkleParseError {
    #[error("serialized merkle block truncated")]
    Truncated,
    #[error("bad varint: {0}")]
    BadVarInt(#[from] varint::DecodeError),
}

/// A block header plus the partial merkle tree naming which transactions
/// matched the installed filter.
///
/// `height` is not on the wire; it is assigned during chain verification and
/// must be persisted alongside the serialized block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlock {
    pub block_hash: BlockHash,
    pub version: u32,
    pub prev_block: BlockHash,
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    /// Difficulty target in compact form.
    pub target: u32,
    pub nonce: u32,
    /// Total transactions in the full block; 0 for a bare header.
    pub total_tx: u32,
    pub hashes: Vec<TxId>,
    pub flags: Vec<u8>,
    pub height: u32,
}

/// Number of levels below the merkle root for a block of `n` transactions.
fn ceil_log2(n: u32) -> u32 {
    32 - n.saturating_sub(1).leading_zeros()
}

struct TreeCursor<'a> {
    block: &'a MerkleBlock,
    hash_idx: usize,
    flag_idx: usize,
}

impl TreeCursor<'_> {
    fn next_flag(&mut self) -> Option<bool> {
        let byte = *self.block.flags.get(self.flag_idx / 8)?;
        let flag = byte & (1 << (self.flag_idx % 8)) != 0;
        self.flag_idx += 1;
        Some(flag)
    }

    /// Walks the tree, collecting matched leaves into `matched` and returning
    /// the subtree hash, or `None` if the encoding is exhausted or malformed.
    fn walk(
        &mut self,
        depth: u32,
        matched: &mut Vec<TxId>,
    ) -> Option<[u8; 32]> {
        if self.hash_idx >= self.block.hashes.len() {
            return None;
        }
        let flag = self.next_flag()?;

        if !flag || depth == ceil_log2(self.block.total_tx) {
            let hash = self.block.hashes.get(self.hash_idx)?;
            self.hash_idx += 1;
            if flag {
                matched.push(*hash);
            }
            return Some(hash.0);
        }

        let left = self.walk(depth + 1, matched)?;
        // A right branch may be missing at the frontier; duplicate the left
        // branch then, but never accept identical child hashes
        // (CVE-2012-2459).
        let right = match self.walk(depth + 1, matched) {
            Some(right) if right == left => return None,
            Some(right) => right,
            None => left,
        };

        let mut pair = [0u8; 64];
        pair[..32].copy_from_slice(&left);
        pair[32..].copy_from_slice(&right);
        Some(sha256d(&pair))
    }
}

impl MerkleBlock {
    /// The double-SHA256 of the 80-byte header.
    pub fn compute_block_hash(&self) -> BlockHash {
        let mut header = Vec::with_capacity(80);
        self.write_header(&mut header);
        BlockHash(sha256d(&header))
    }

    fn write_header(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.prev_block.0);
        buf.extend_from_slice(&self.merkle_root);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.target.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            80 + 4 + 9 + self.hashes.len() * 32 + 9 + self.flags.len(),
        );
        self.write_header(&mut buf);

        if self.total_tx > 0 {
            buf.extend_from_slice(&self.total_tx.to_le_bytes());
            varint::write(&mut buf, self.hashes.len() as u64);
            for hash in &self.hashes {
                buf.extend_from_slice(&hash.0);
            }
            varint::write(&mut buf, self.flags.len() as u64);
            buf.extend_from_slice(&self.flags);
        }
        buf
    }

    /// Parses a header or merkle block. `height` comes out as
    /// `BLOCK_UNKNOWN_HEIGHT`.
    pub fn parse(buf: &[u8]) -> Result<Self, MerkleParseError> {
        let header: &[u8; 80] = buf
            .get(..80)
            .ok_or(MerkleParseError::Truncated)?
            .try_into()
            .unwrap();

        let mut block = Self {
            block_hash: BlockHash(sha256d(header)),
            version: u32::from_le_bytes(header[0..4].try_into().unwrap()),
            prev_block: BlockHash(header[4..36].try_into().unwrap()),
            merkle_root: header[36..68].try_into().unwrap(),
            timestamp: u32::from_le_bytes(header[68..72].try_into().unwrap()),
            target: u32::from_le_bytes(header[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(header[76..80].try_into().unwrap()),
            total_tx: 0,
            hashes: Vec::new(),
            flags: Vec::new(),
            height: BLOCK_UNKNOWN_HEIGHT,
        };

        let rest = &buf[80..];
        if rest.is_empty() {
            return Ok(block);
        }

        let mut off = 0;
        let total: &[u8; 4] = rest
            .get(..4)
            .ok_or(MerkleParseError::Truncated)?
            .try_into()
            .unwrap();
        block.total_tx = u32::from_le_bytes(*total);
        off += 4;

        let (count, used) = varint::read(&rest[off..])?;
        off += used;
        for _ in 0..count {
            let hash = rest
                .get(off..off + 32)
                .ok_or(MerkleParseError::Truncated)?;
            block.hashes.push(TxId(hash.try_into().unwrap()));
            off += 32;
        }

        let (flags_len, used) = varint::read(&rest[off..])?;
        off += used;
        let flags = rest
            .get(off..off + flags_len as usize)
            .ok_or(MerkleParseError::Truncated)?;
        block.flags = flags.to_vec();

        Ok(block)
    }

    /// The transactions in this block that matched the filter.
    pub fn tx_hashes(&self) -> Vec<TxId> {
        let mut matched = Vec::new();
        if self.total_tx > 0 {
            let mut cursor = TreeCursor {
                block: self,
                hash_idx: 0,
                flag_idx: 0,
            };
            cursor.walk(0, &mut matched);
        }
        matched
    }

    pub fn contains_tx_hash(&self, hash: TxId) -> bool {
        self.hashes.contains(&hash)
    }

    /// True if the partial merkle tree reproduces the header's merkle root.
    /// Vacuously true for a bare header.
    pub fn is_merkle_valid(&self) -> bool {
        if self.total_tx == 0 {
            return true;
        }
        let mut matched = Vec::new();
        let mut cursor = TreeCursor {
            block: self,
            hash_idx: 0,
            flag_idx: 0,
        };
        cursor.walk(0, &mut matched) == Some(self.merkle_root)
    }

    /// True if the header hash satisfies its own compact difficulty target.
    /// The *policy* question of whether the target itself is allowed belongs
    /// to the chain params' difficulty verification.
    pub fn verify_pow(&self) -> bool {
        let size = (self.target >> 24) as usize;
        let mantissa = self.target & 0x00ff_ffff;

        // reject negative or zero targets
        if mantissa == 0 || self.target & 0x0080_0000 != 0 {
            return false;
        }

        // expand the compact target to a 256-bit big-endian number
        let mut target = [0u8; 32];
        let mantissa_bytes = mantissa.to_be_bytes();
        for (i, &byte) in mantissa_bytes[1..].iter().enumerate() {
            // byte i of the mantissa lands `size - 1 - i` bytes from the end
            let Some(exp) = size.checked_sub(1 + i) else { continue };
            if exp >= 32 {
                return false; // target overflows 256 bits
            }
            target[31 - exp] = byte;
        }

        let mut hash_be = self.block_hash.0;
        hash_be.reverse();
        hash_be <= target
    }
}
