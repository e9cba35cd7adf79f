use std::fmt::{self, Display};

use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

use crate::time::TimestampMs;

/// Identifies a block in the best (or a side) chain: its hash plus the height
/// it was observed at. The wallet core never validates headers; it only
/// consumes "block seen" signals carrying one of these.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: BlockHash,
    pub height: u32,
}

impl BlockId {
    pub fn new(hash: BlockHash, height: u32) -> Self {
        Self { hash, height }
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.hash, self.height)
    }
}

/// The wallet's record of the last best block it has fully processed:
/// hash, height, and the (header) time at which it was seen.
///
/// `None` at the wallet level means "no block seen yet"; we deliberately use
/// an [`Option`] rather than a magic sentinel height.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LastBlockSeen {
    pub block: BlockId,
    pub time: TimestampMs,
}

/// How a transaction-in-block notification relates to the best chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BlockType {
    /// The block is part of the best known chain.
    BestChain,
    /// The block is on a side chain; its transactions are not confirmed.
    SideChain,
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::hashes::Hash as _;

    use super::*;

    #[test]
    fn block_id_display() {
        let hash = BlockHash::all_zeros();
        let block = BlockId::new(hash, 840_000);
        let displayed = block.to_string();
        assert!(displayed.ends_with("@840000"));
        assert_eq!(BlockHash::from_str(&displayed[..64]).unwrap(), hash);
    }
}
