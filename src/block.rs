use std::{
    alloc::Layout,
    cell::Cell,
    mem::{self, ManuallyDrop, MaybeUninit},
    ptr::{self, NonNull},
};

use crate::alloc::{AllocError, Allocator};

/// Releases a pointee that was handed to a [`Shared`][crate::Shared] as a raw pointer.
pub trait Deleter<T>
where
    T: ?Sized,
{
    /// # Safety
    ///
    /// Called exactly once, with the pointer the handle was created from.
    unsafe fn delete(&mut self, ptr: NonNull<T>);
}

/// Reclaims the pointee as a `Box<T>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultDelete;

impl<T> Deleter<T> for DefaultDelete
where
    T: ?Sized,
{
    unsafe fn delete(&mut self, ptr: NonNull<T>) {
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

impl<T, F> Deleter<T> for F
where
    T: ?Sized,
    F: FnMut(NonNull<T>),
{
    unsafe fn delete(&mut self, ptr: NonNull<T>) {
        self(ptr)
    }
}

/// The part of every control block that handles see. Always the first field of a block, so a
/// `NonNull<Header>` can be cast back to the concrete block by its own vtable.
#[repr(C)]
pub(crate) struct Header {
    strong: Cell<usize>,
    weak: Cell<usize>,
    vtable: &'static VTable,
}

struct VTable {
    /// Ends the pointee's lifetime. Storage stays allocated.
    dispose: unsafe fn(NonNull<Header>),
    /// Drops what is left of the block and frees its storage.
    destroy: unsafe fn(NonNull<Header>),
}

impl Header {
    fn new(vtable: &'static VTable) -> Self {
        Header {
            strong: Cell::new(1),
            weak: Cell::new(0),
            vtable,
        }
    }
}

fn increment(count: &Cell<usize>) {
    let n = count.get().wrapping_add(1);
    count.set(n);

    // a count can only wrap if handles were leaked `usize::MAX` times
    if n == 0 {
        std::process::abort();
    }
}

/// A reference to a live control block. Copying it does not touch the counts; every handle that
/// stores one is responsible for exactly one strong or weak unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockRef(NonNull<Header>);

impl BlockRef {
    fn header(&self) -> &Header {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn strong(self) -> usize {
        self.header().strong.get()
    }

    pub(crate) fn weak(self) -> usize {
        self.header().weak.get()
    }

    pub(crate) fn acquire_strong(self) {
        debug_assert!(self.strong() > 0);
        increment(&self.header().strong);
    }

    pub(crate) fn acquire_weak(self) {
        increment(&self.header().weak);
    }

    /// Gives back one strong unit. Disposes of the pointee on the last one, and destroys the
    /// block if no weak units remain.
    ///
    /// # Safety
    ///
    /// The caller owns a strong unit and must not use this block again.
    pub(crate) unsafe fn release_strong(self) {
        let header = self.header();
        debug_assert!(header.strong.get() > 0);

        let n = header.strong.get() - 1;
        header.strong.set(n);
        if n != 0 {
            return;
        }

        // the pointee may own weak handles to its own block; hold a weak unit so dropping them
        // cannot destroy the block while it is still being disposed of
        increment(&header.weak);

        log::trace!("block {:p}: dispose", self.0);
        let dispose = header.vtable.dispose;
        dispose(self.0);

        self.release_weak();
    }

    /// Gives back one weak unit. Destroys the block once both counts are zero.
    ///
    /// # Safety
    ///
    /// The caller owns a weak unit and must not use this block again.
    pub(crate) unsafe fn release_weak(self) {
        let header = self.header();
        debug_assert!(header.weak.get() > 0);

        let n = header.weak.get() - 1;
        header.weak.set(n);
        if n != 0 || header.strong.get() != 0 {
            return;
        }

        log::trace!("block {:p}: destroy", self.0);
        let destroy = header.vtable.destroy;
        destroy(self.0);
    }
}

fn allocate_block<B, A>(alloc: &A) -> Result<NonNull<B>, AllocError>
where
    A: Allocator,
{
    alloc.allocate(Layout::new::<B>()).map(NonNull::cast)
}

/// A block for a pointee that was allocated elsewhere and is released by a [`Deleter`].
#[repr(C)]
pub(crate) struct DirectBlock<Y, D, A>
where
    Y: ?Sized,
{
    header: Header,
    ptr: NonNull<Y>,
    deleter: ManuallyDrop<D>,
    alloc: ManuallyDrop<A>,
}

impl<Y, D, A> DirectBlock<Y, D, A>
where
    Y: ?Sized,
    D: Deleter<Y>,
    A: Allocator,
{
    const VTABLE: VTable = VTable {
        dispose: Self::dispose,
        destroy: Self::destroy,
    };

    /// Allocates a block that owns `ptr`. If the block cannot be allocated the pointee is handed
    /// to `deleter` before the error is returned.
    ///
    /// # Safety
    ///
    /// `deleter` must be able to release `ptr`, and `ptr` must stay valid until it does.
    pub(crate) unsafe fn allocate(
        ptr: NonNull<Y>,
        mut deleter: D,
        alloc: A,
    ) -> Result<BlockRef, AllocError> {
        let block = match allocate_block::<Self, A>(&alloc) {
            Ok(block) => block,
            Err(err) => {
                deleter.delete(ptr);
                return Err(err);
            }
        };

        block.as_ptr().write(DirectBlock {
            header: Header::new(&Self::VTABLE),
            ptr,
            deleter: ManuallyDrop::new(deleter),
            alloc: ManuallyDrop::new(alloc),
        });
        log::trace!("block {:p}: allocated direct", block);

        Ok(BlockRef(block.cast()))
    }

    unsafe fn dispose(header: NonNull<Header>) {
        let this = header.cast::<Self>().as_ptr();
        let ptr = (*this).ptr;

        <D as Deleter<Y>>::delete(&mut *ptr::addr_of_mut!((*this).deleter), ptr);
    }

    unsafe fn destroy(header: NonNull<Header>) {
        let this = header.cast::<Self>().as_ptr();

        ManuallyDrop::drop(&mut *ptr::addr_of_mut!((*this).deleter));
        let alloc = ManuallyDrop::take(&mut *ptr::addr_of_mut!((*this).alloc));

        alloc.deallocate(header.cast(), Layout::new::<Self>());
    }
}

/// A block that stores its pointee inline, so one allocation serves both.
#[repr(C)]
pub(crate) struct CombinedBlock<T, A> {
    header: Header,
    alloc: ManuallyDrop<A>,
    value: MaybeUninit<T>,
}

impl<T, A> CombinedBlock<T, A>
where
    A: Allocator,
{
    const VTABLE: VTable = VTable {
        dispose: Self::dispose,
        destroy: Self::destroy,
    };

    /// Allocates a block and constructs the pointee in it with `init`. Returns the block and the
    /// address of the pointee inside it.
    pub(crate) fn allocate_with<F>(alloc: A, init: F) -> Result<(BlockRef, NonNull<T>), AllocError>
    where
        F: FnOnce() -> T,
    {
        let block = allocate_block::<Self, A>(&alloc)?;

        // frees the storage again if `init` panics
        struct Unwind<'a, B, A: Allocator> {
            block: NonNull<B>,
            alloc: &'a A,
        }

        impl<B, A: Allocator> Drop for Unwind<'_, B, A> {
            fn drop(&mut self) {
                unsafe {
                    self.alloc
                        .deallocate(self.block.cast(), Layout::new::<B>())
                };
            }
        }

        let unwind = Unwind {
            block,
            alloc: &alloc,
        };
        let value = unsafe {
            let value = ptr::addr_of_mut!((*block.as_ptr()).value).cast::<T>();
            value.write(init());
            NonNull::new_unchecked(value)
        };
        mem::forget(unwind);

        unsafe {
            ptr::addr_of_mut!((*block.as_ptr()).header).write(Header::new(&Self::VTABLE));
            ptr::addr_of_mut!((*block.as_ptr()).alloc).write(ManuallyDrop::new(alloc));
        }
        log::trace!("block {:p}: allocated combined", block);

        Ok((BlockRef(block.cast()), value))
    }

    unsafe fn dispose(header: NonNull<Header>) {
        let this = header.cast::<Self>().as_ptr();

        ptr::drop_in_place(ptr::addr_of_mut!((*this).value).cast::<T>());
    }

    unsafe fn destroy(header: NonNull<Header>) {
        let this = header.cast::<Self>().as_ptr();
        let alloc = ManuallyDrop::take(&mut *ptr::addr_of_mut!((*this).alloc));

        alloc.deallocate(header.cast(), Layout::new::<Self>());
    }
}
