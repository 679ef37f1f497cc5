use std::{alloc::Layout, ptr::NonNull};

use thiserror::Error;

/// Returned when an [`Allocator`] cannot satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory allocation of {} bytes failed", .layout.size())]
pub struct AllocError {
    layout: Layout,
}

impl AllocError {
    pub fn new(layout: Layout) -> Self {
        AllocError { layout }
    }

    /// The layout of the request that failed.
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// A source of memory for control blocks.
///
/// Allocators are untyped: every request carries the [`Layout`] of the block being created, so a
/// single allocator value serves every block type a handle may need. The allocator passed to a
/// constructor is moved into the control block and later used to free that same block.
///
/// # Safety
///
/// `allocate` must return memory that is valid for `layout` and stays valid until it is passed
/// back to `deallocate` with the same layout. Requests always have a non-zero size.
pub unsafe trait Allocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the same `layout`, and
    /// must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global allocator, as used by [`Box`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Global;

unsafe impl Allocator for Global {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() != 0);

        NonNull::new(unsafe { std::alloc::alloc(layout) }).ok_or(AllocError::new(layout))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

unsafe impl<A> Allocator for &A
where
    A: Allocator + ?Sized,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        A::allocate(*self, layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        A::deallocate(*self, ptr, layout)
    }
}
