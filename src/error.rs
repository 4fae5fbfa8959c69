use thiserror::Error;

/// Failure taxonomy of the pool. Every fallible operation reports exactly one
/// of these kinds; the pool itself stays usable after any error except
/// [`PoolError::Corruption`], which means an invariant was broken by an
/// external write and the pool should be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Zero-sized request, an alignment that is not a power of two or out of
    /// the supported range, a full class table, a zero-capacity class, or an
    /// arithmetic overflow while sizing a `calloc`.
    #[error("invalid size or alignment")]
    InvalidSize,

    /// No free block large enough could be formed. For variable-size
    /// allocations this is only surfaced after chain growth itself failed;
    /// fixed-size classes and `add_size_class` never grow the chain.
    #[error("out of memory")]
    OutOfMemory,

    /// The pointer is not owned by any link of the chain, or its header tag
    /// does not match.
    #[error("pointer does not belong to the pool")]
    InvalidPointer,

    /// The block or slot behind the pointer is already free.
    #[error("double free")]
    DoubleFree,

    /// An invariant violation was detected by `validate`. The pool is left
    /// untouched so the damage can be inspected.
    #[error("pool corruption detected")]
    Corruption,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(PoolError::OutOfMemory.to_string(), "out of memory");
        assert_eq!(PoolError::DoubleFree.to_string(), "double free");
    }
}
