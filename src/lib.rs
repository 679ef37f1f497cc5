//! Reference counted [`Shared`] and [`Weak`] handles.
//!
//! A [`Shared`] owns one strong unit of a control block; the block tracks how many strong and
//! weak handles refer to it and knows how to release both the pointee and itself. The pointee is
//! dropped exactly when the last `Shared` goes away, and the block is freed once the last
//! [`Weak`] is gone as well. A `Weak` never keeps the pointee alive; it must be promoted with
//! [`Weak::lock`] or [`Weak::upgrade`] before the value can be read.
//!
//! There are two kinds of control block, and every handle type works with both:
//!
//! - [`make_shared`] and [`allocate_shared`] place the value inside the block, so one allocation
//!   holds both.
//! - [`Shared::from_box`], [`Shared::from_raw`] and [`Shared::from_raw_in`] take a pointee that
//!   already lives elsewhere and allocate a separate block holding a [`Deleter`] for it.
//!
//! Blocks are allocated through an [`Allocator`]: [`Global`] by default, or a recycling [`Pool`].
//!
//! Handles convert between pointee types that are declared compatible with [`Derives`], for
//! example from a concrete type to a trait object it implements. Conversions between unrelated
//! types do not compile.
//!
//! Counts are plain integers, so handles are neither `Send` nor `Sync`. Like [`std::rc::Rc`], a
//! cycle of `Shared` handles is never freed; break cycles with `Weak`.
//!
//! ```
//! use tally::make_shared;
//!
//! let a = make_shared(vec![1, 2, 3]);
//! let b = a.clone();
//! assert!(a.use_count() == 2);
//!
//! let w = b.downgrade();
//! drop(a);
//! drop(b);
//! assert!(w.expired());
//! ```

mod alloc;
mod block;
mod derives;
#[cfg(feature = "pool")]
mod pool;
mod shared;
mod weak;

pub use crate::alloc::{AllocError, Allocator, Global};
pub use crate::block::{DefaultDelete, Deleter};
pub use crate::derives::Derives;
#[cfg(feature = "pool")]
pub use crate::pool::Pool;
pub use crate::shared::{
    allocate_shared, allocate_shared_with, make_shared, make_shared_with, try_allocate_shared,
    try_allocate_shared_with, try_make_shared, Shared,
};
pub use crate::weak::Weak;

#[cfg(test)]
mod test;
