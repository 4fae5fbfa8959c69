//! User-space memory pool allocator for long-running, allocation-heavy
//! processes. A [`Pool`] maps one or more large backing regions up front and
//! serves every request out of them: variable-size allocations go through a
//! boundary-tag free-list heap with best-fit search and eager coalescing,
//! while exact-size hot paths can be served in O(1) from pre-carved
//! fixed-size classes. When a pool runs dry it grows by chaining a new
//! backing region behind the first one, transparently to the caller.
//!
//! ```no_run
//! use pagepool::Pool;
//!
//! let pool = Pool::new(16 * 1024 * 1024).unwrap();
//!
//! let p = pool.alloc(1024).unwrap();
//! unsafe {
//!     p.as_ptr().write_bytes(0xAB, 1024);
//!     pool.free(p).unwrap();
//! }
//! assert!(pool.validate().is_ok());
//! ```

use std::ptr::NonNull;

mod alignment;
mod block;
mod classes;
mod config;
mod error;
mod freelist;
mod header;
mod heap;
mod list;
mod platform;
mod pool;
mod region;
mod stats;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use config::{PoolConfig, SizeClassSpec, MAX_SIZE_CLASSES};
pub use error::PoolError;
pub use pool::Pool;
pub use stats::PoolStats;
