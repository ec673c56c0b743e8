//! Small type aliases shared across the ledger crates.

/// Alias for a transaction identifier.
pub type TxId = crate::Hash256;

/// Alias for a block identifier.
pub type BlockId = crate::Hash256;

/// Alias for a monetary amount, in the smallest indivisible unit.
pub type Amount = u64;

/// Alias for a Unix timestamp, seconds since the epoch.
pub type Timestamp = u64;

/// Alias for a block height.
pub type BlockHeight = u64;

/// Alias for the index of an output within its confirming transaction.
pub type OutputIndex = u32;

/// Alias for the index of an input within its owning transaction.
pub type InputIndex = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_expected_underlying_types() {
        let _: TxId = crate::Hash256::zero();
        let _: Amount = 0u64;
        let _: BlockHeight = 0u64;
    }
}
