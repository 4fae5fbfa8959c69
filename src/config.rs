use crate::{alignment::WORD_SIZE, error::PoolError, platform::page_size};

/// Upper bound on the number of fixed-size classes per pool.
pub const MAX_SIZE_CLASSES: usize = 16;

/// Default payload alignment: one cache line on common hardware.
pub(crate) const DEFAULT_ALIGNMENT: usize = 64;

/// Largest single request the pool accepts. Anything bigger is a sign of a
/// sizing bug in the caller and would overflow the padding arithmetic.
pub(crate) const MAX_REQUEST: usize = isize::MAX as usize / 2;

/// Seed definition of one fixed-size class, see
/// [`crate::Pool::add_size_class`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassSpec {
    /// Slot size in bytes.
    pub slot_size: usize,
    /// Number of slots carved up front.
    pub capacity: usize,
}

/// Construction parameters of a [`crate::Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of the first backing region in bytes, rounded up to whole pages.
    pub pool_size: usize,
    /// Whether the pool is meant to be shared across threads. Recorded for
    /// callers that branch on it; the chain lock is kept either way since an
    /// uncontended acquisition costs a single atomic exchange.
    pub thread_safe: bool,
    /// Payload alignment for every variable-size allocation. Must be a power
    /// of two between the word size and the page size.
    pub alignment: usize,
    /// Whether generic `alloc` calls may be served from a fixed-size class
    /// whose slot size matches the request exactly.
    pub enable_size_classes: bool,
    /// Classes carved at construction time (and again on `reset`). At most
    /// [`MAX_SIZE_CLASSES`] entries.
    pub size_classes: Vec<SizeClassSpec>,
}

impl PoolConfig {
    /// Defaults: thread safe, cache-line alignment, exact-match fast path
    /// enabled, no pre-carved classes.
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            thread_safe: true,
            alignment: DEFAULT_ALIGNMENT,
            enable_size_classes: true,
            size_classes: Vec::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 || self.pool_size > MAX_REQUEST {
            return Err(PoolError::InvalidSize);
        }

        if !self.alignment.is_power_of_two()
            || self.alignment < WORD_SIZE
            || self.alignment > page_size()
        {
            return Err(PoolError::InvalidSize);
        }

        if self.size_classes.len() > MAX_SIZE_CLASSES {
            return Err(PoolError::InvalidSize);
        }

        for spec in &self.size_classes {
            if spec.slot_size == 0
                || spec.slot_size > MAX_REQUEST
                || spec.capacity == 0
                || spec.capacity > u32::MAX as usize
            {
                return Err(PoolError::InvalidSize);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PoolConfig::new(16 * 1024 * 1024).validate().is_ok());
    }

    #[test]
    fn rejects_broken_configs() {
        assert_eq!(
            PoolConfig::new(0).validate(),
            Err(PoolError::InvalidSize)
        );

        let mut bad_align = PoolConfig::new(1024 * 1024);
        bad_align.alignment = 24;
        assert_eq!(bad_align.validate(), Err(PoolError::InvalidSize));

        let mut too_many = PoolConfig::new(1024 * 1024);
        too_many.size_classes = vec![
            SizeClassSpec {
                slot_size: 64,
                capacity: 8
            };
            MAX_SIZE_CLASSES + 1
        ];
        assert_eq!(too_many.validate(), Err(PoolError::InvalidSize));

        let mut zero_slot = PoolConfig::new(1024 * 1024);
        zero_slot.size_classes = vec![SizeClassSpec {
            slot_size: 0,
            capacity: 8,
        }];
        assert_eq!(zero_slot.validate(), Err(PoolError::InvalidSize));
    }
}
