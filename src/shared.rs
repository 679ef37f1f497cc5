use std::{
    alloc::handle_alloc_error,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem,
    ops::Deref,
    ptr::NonNull,
};

use crate::{
    alloc::{AllocError, Allocator, Global},
    block::{BlockRef, CombinedBlock, DefaultDelete, Deleter, DirectBlock},
    derives::Derives,
    weak::Weak,
};

/// A bound handle: the control block and the pointee address derived from it when the handle
/// was first created.
pub(crate) struct Raw<T>
where
    T: ?Sized,
{
    pub(crate) block: BlockRef,
    pub(crate) ptr: NonNull<T>,
}

impl<T> Raw<T>
where
    T: ?Sized,
{
    pub(crate) fn cast<U>(self) -> Raw<U>
    where
        T: Derives<U>,
        U: ?Sized,
    {
        Raw {
            block: self.block,
            ptr: T::upcast(self.ptr),
        }
    }
}

impl<T> Clone for Raw<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Raw<T> where T: ?Sized {}

/// A reference counted owning handle, similar to [`Rc`].
///
/// A `Shared` is either null or bound to a control block, in which case it owns one strong unit
/// of that block. The pointee is dropped when the last strong unit is released; the block itself
/// is freed once the last [`Weak`] is gone as well.
///
/// Handles are created by [`make_shared`] (one allocation for block and value) or from a pointee
/// that already lives elsewhere ([`Shared::from_box`], [`Shared::from_raw`] and friends).
///
/// [`Rc`]: std::rc::Rc
pub struct Shared<T>
where
    T: ?Sized,
{
    inner: Option<Raw<T>>,
    _marker: PhantomData<T>,
}

impl<T> Shared<T>
where
    T: ?Sized,
{
    /// Creates a handle that owns nothing.
    pub const fn null() -> Self {
        Shared {
            inner: None,
            _marker: PhantomData,
        }
    }

    /// # Safety
    ///
    /// The caller hands over one strong unit of `raw.block`.
    pub(crate) unsafe fn from_inner(raw: Raw<T>) -> Self {
        Shared {
            inner: Some(raw),
            _marker: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> Option<Raw<T>> {
        self.inner
    }

    /// Takes ownership of a boxed value. The box stays where it is and a separate control block
    /// is allocated for it. A box of a concrete type coerces to a box of a trait object it
    /// implements as usual.
    ///
    /// ```
    /// # use tally::Shared;
    /// let s: Shared<str> = Shared::from_box(Box::from("text"));
    /// assert!(&*s == "text");
    /// ```
    pub fn from_box(boxed: Box<T>) -> Self {
        Self::from_box_in(boxed, Global)
    }

    /// Like [`Shared::from_box`], allocating the control block from `alloc`.
    pub fn from_box_in<A>(boxed: Box<T>, alloc: A) -> Self
    where
        A: Allocator + 'static,
    {
        unsafe { Self::from_raw_in(Box::into_raw(boxed), DefaultDelete, alloc) }
    }

    /// Like [`Shared::from_box_in`], but returns an error instead of aborting when the control
    /// block cannot be allocated. The box is dropped in that case.
    pub fn try_from_box_in<A>(boxed: Box<T>, alloc: A) -> Result<Self, AllocError>
    where
        A: Allocator + 'static,
    {
        unsafe { Self::try_from_raw_in(Box::into_raw(boxed), DefaultDelete, alloc) }
    }

    /// Takes ownership of a pointer obtained from [`Box::into_raw`]. A null pointer gives a null
    /// handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or come from `Box<Y>::into_raw`, and must not be owned by anything else.
    pub unsafe fn from_raw<Y>(ptr: *mut Y) -> Self
    where
        Y: Derives<T> + ?Sized,
    {
        Self::from_raw_in(ptr, DefaultDelete, Global)
    }

    /// Takes ownership of a pointer that `deleter` will release once the last strong handle is
    /// gone.
    ///
    /// ```
    /// # use std::{cell::Cell, ptr::NonNull, rc::Rc};
    /// # use tally::Shared;
    /// let deleted = Rc::new(Cell::new(false));
    /// let flag = Rc::clone(&deleted);
    ///
    /// let raw = Box::into_raw(Box::new(5));
    /// let s: Shared<i32> = unsafe {
    ///     Shared::from_raw_with_deleter(raw, move |ptr: NonNull<i32>| {
    ///         flag.set(true);
    ///         drop(Box::from_raw(ptr.as_ptr()));
    ///     })
    /// };
    ///
    /// assert!(*s == 5);
    /// drop(s);
    /// assert!(deleted.get());
    /// ```
    ///
    /// # Safety
    ///
    /// `ptr` must be null or valid until `deleter` is called with it.
    pub unsafe fn from_raw_with_deleter<Y, D>(ptr: *mut Y, deleter: D) -> Self
    where
        Y: Derives<T> + ?Sized,
        D: Deleter<Y> + 'static,
    {
        Self::from_raw_in(ptr, deleter, Global)
    }

    /// Takes ownership of a pointer with a custom deleter, allocating the control block from
    /// `alloc`. Aborts through [`handle_alloc_error`] if the block cannot be allocated.
    ///
    /// # Safety
    ///
    /// See [`Shared::from_raw_with_deleter`].
    pub unsafe fn from_raw_in<Y, D, A>(ptr: *mut Y, deleter: D, alloc: A) -> Self
    where
        Y: Derives<T> + ?Sized,
        D: Deleter<Y> + 'static,
        A: Allocator + 'static,
    {
        match Self::try_from_raw_in(ptr, deleter, alloc) {
            Ok(shared) => shared,
            Err(err) => handle_alloc_error(err.layout()),
        }
    }

    /// Fallible form of [`Shared::from_raw_in`]. On error the pointee has already been passed to
    /// `deleter`.
    ///
    /// # Safety
    ///
    /// See [`Shared::from_raw_with_deleter`].
    pub unsafe fn try_from_raw_in<Y, D, A>(
        ptr: *mut Y,
        deleter: D,
        alloc: A,
    ) -> Result<Self, AllocError>
    where
        Y: Derives<T> + ?Sized,
        D: Deleter<Y> + 'static,
        A: Allocator + 'static,
    {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(Self::null());
        };

        let block = DirectBlock::allocate(ptr, deleter, alloc)?;
        let raw = Raw { block, ptr };

        Ok(Self::from_inner(raw.cast()))
    }

    /// Converts into a handle of a compatible type. The strong unit moves with it.
    ///
    /// ```
    /// # use std::fmt::Display;
    /// # use tally::{derives, make_shared, Shared};
    /// struct Name(&'static str);
    ///
    /// impl std::fmt::Display for Name {
    ///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    ///         f.write_str(self.0)
    ///     }
    /// }
    ///
    /// derives!(Name => dyn Display);
    ///
    /// let name = make_shared(Name("ada"));
    /// let shown: Shared<dyn Display> = name.upcast();
    /// assert!(shown.to_string() == "ada");
    /// assert!(shown.use_count() == 1);
    /// ```
    pub fn upcast<U>(mut self) -> Shared<U>
    where
        T: Derives<U>,
        U: ?Sized,
    {
        match self.inner.take() {
            Some(raw) => unsafe { Shared::from_inner(raw.cast()) },
            None => Shared::null(),
        }
    }

    /// Creates another owner of the same block, viewed as a compatible type.
    pub fn upcast_ref<U>(&self) -> Shared<U>
    where
        T: Derives<U>,
        U: ?Sized,
    {
        self.clone().upcast()
    }

    /// Makes `self` another owner of `other`'s block. The previous binding is released only after
    /// the new one is in place, so assigning a handle to itself is fine.
    ///
    /// ```
    /// # use tally::make_shared;
    /// let a = make_shared(1);
    /// let mut b = make_shared(2);
    ///
    /// b.assign(&a);
    /// assert!(*b == 1);
    /// assert!(a.use_count() == 2);
    ///
    /// let c = b.clone();
    /// b.assign(&c);
    /// assert!(a.use_count() == 3);
    /// ```
    pub fn assign<Y>(&mut self, other: &Shared<Y>)
    where
        Y: Derives<T> + ?Sized,
    {
        let mut replacement = other.upcast_ref();
        self.swap(&mut replacement);
    }

    /// Moves `other`'s binding into `self`, releasing the previous one.
    pub fn assign_from<Y>(&mut self, other: Shared<Y>)
    where
        Y: Derives<T> + ?Sized,
    {
        let mut replacement = other.upcast();
        self.swap(&mut replacement);
    }

    /// Exchanges the bindings of two handles. Counts are untouched.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.inner, &mut other.inner);
    }

    /// Releases the current binding and leaves the handle null.
    pub fn reset(&mut self) {
        let mut old = Self::null();
        self.swap(&mut old);
    }

    /// Releases the current binding and takes ownership of `boxed` instead.
    pub fn reset_box(&mut self, boxed: Box<T>) {
        let mut replacement = Self::from_box(boxed);
        self.swap(&mut replacement);
    }

    /// Releases the current binding and takes ownership of `ptr` instead.
    ///
    /// # Safety
    ///
    /// See [`Shared::from_raw`].
    pub unsafe fn reset_raw<Y>(&mut self, ptr: *mut Y)
    where
        Y: Derives<T> + ?Sized,
    {
        let mut replacement = Self::from_raw(ptr);
        self.swap(&mut replacement);
    }

    /// Number of strong handles bound to this block, `self` included. A null handle reports 0.
    ///
    /// ```
    /// # use tally::make_shared;
    /// let a = make_shared(5);
    /// let b = a.clone();
    /// assert!(a.use_count() == 2 && b.use_count() == 2);
    ///
    /// drop(b);
    /// assert!(a.use_count() == 1);
    /// ```
    pub fn use_count(&self) -> usize {
        self.inner.map_or(0, |raw| raw.block.strong())
    }

    /// Number of weak handles bound to this block.
    pub fn weak_count(&self) -> usize {
        self.inner.map_or(0, |raw| raw.block.weak())
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// The pointee, or `None` for a null handle. This hides any `get` method of the pointee
    /// itself; reach that one through `(*handle).get()`.
    ///
    /// ```
    /// # use std::cell::Cell;
    /// # use tally::{make_shared, Shared};
    /// let s = make_shared(Cell::new(2));
    /// assert!(s.get().map(Cell::get) == Some(2));
    /// assert!((*s).get() == 2);
    /// assert!(Shared::<Cell<i32>>::null().get().is_none());
    /// ```
    pub fn get(&self) -> Option<&T> {
        self.inner.map(|raw| unsafe { raw.ptr.as_ref() })
    }

    /// Mutable access to the pointee, provided no other strong or weak handle exists.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self.inner {
            Some(mut raw) if raw.block.strong() == 1 && raw.block.weak() == 0 => {
                Some(unsafe { raw.ptr.as_mut() })
            }
            _ => None,
        }
    }

    /// The cached pointee address.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.inner.map(|raw| raw.ptr)
    }

    /// Whether both handles share a control block. Two null handles are equal.
    pub fn ptr_eq<U>(&self, other: &Shared<U>) -> bool
    where
        U: ?Sized,
    {
        self.inner.map(|raw| raw.block) == other.inner.map(|raw| raw.block)
    }

    /// Creates a weak handle to the same block.
    pub fn downgrade(&self) -> Weak<T> {
        Weak::from_shared(self)
    }
}

#[cold]
#[track_caller]
fn null_deref() -> ! {
    panic!("dereferenced a null `Shared`")
}

impl<T> Clone for Shared<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        match self.inner {
            Some(raw) => {
                raw.block.acquire_strong();
                unsafe { Self::from_inner(raw) }
            }
            None => Self::null(),
        }
    }
}

impl<T> Drop for Shared<T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        if let Some(raw) = self.inner.take() {
            unsafe { raw.block.release_strong() };
        }
    }
}

impl<T> Deref for Shared<T>
where
    T: ?Sized,
{
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is null.
    #[track_caller]
    fn deref(&self) -> &T {
        match self.get() {
            Some(value) => value,
            None => null_deref(),
        }
    }
}

impl<T> AsRef<T> for Shared<T>
where
    T: ?Sized,
{
    #[track_caller]
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T> Default for Shared<T>
where
    T: ?Sized,
{
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Box<T>> for Shared<T>
where
    T: ?Sized,
{
    fn from(boxed: Box<T>) -> Self {
        Self::from_box(boxed)
    }
}

impl<T> fmt::Debug for Shared<T>
where
    T: fmt::Debug + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("Shared(null)"),
        }
    }
}

impl<T> fmt::Display for Shared<T>
where
    T: fmt::Display + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => fmt::Display::fmt(value, f),
            None => f.write_str("null"),
        }
    }
}

impl<T> fmt::Pointer for Shared<T>
where
    T: ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_ptr() {
            Some(ptr) => fmt::Pointer::fmt(&ptr, f),
            None => fmt::Pointer::fmt(&std::ptr::null::<u8>(), f),
        }
    }
}

impl<T> PartialEq for Shared<T>
where
    T: PartialEq + ?Sized,
{
    fn eq(&self, other: &Self) -> bool {
        PartialEq::eq(&self.get(), &other.get())
    }
}

impl<T> Eq for Shared<T> where T: Eq + ?Sized {}

impl<T> PartialOrd for Shared<T>
where
    T: PartialOrd + ?Sized,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        PartialOrd::partial_cmp(&self.get(), &other.get())
    }
}

impl<T> Ord for Shared<T>
where
    T: Ord + ?Sized,
{
    fn cmp(&self, other: &Self) -> Ordering {
        Ord::cmp(&self.get(), &other.get())
    }
}

impl<T> Hash for Shared<T>
where
    T: Hash + ?Sized,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        Hash::hash(&self.get(), state)
    }
}

/// Creates a handle whose control block and value share one allocation.
///
/// ```
/// # use std::cell::Cell;
/// # use tally::make_shared;
/// let a = make_shared(Cell::new(5));
/// let b = a.clone();
///
/// b.set(6);
/// assert!((*a).get() == 6);
/// ```
pub fn make_shared<T>(value: T) -> Shared<T> {
    allocate_shared(Global, value)
}

/// Like [`make_shared`], constructing the value inside the new block with `init`.
pub fn make_shared_with<T, F>(init: F) -> Shared<T>
where
    F: FnOnce() -> T,
{
    allocate_shared_with(Global, init)
}

/// Like [`make_shared`], allocating from `alloc`. Aborts through [`handle_alloc_error`] if the
/// block cannot be allocated.
pub fn allocate_shared<T, A>(alloc: A, value: T) -> Shared<T>
where
    A: Allocator + 'static,
{
    allocate_shared_with(alloc, move || value)
}

/// Like [`allocate_shared`], constructing the value inside the new block with `init`.
pub fn allocate_shared_with<T, A, F>(alloc: A, init: F) -> Shared<T>
where
    A: Allocator + 'static,
    F: FnOnce() -> T,
{
    match try_allocate_shared_with(alloc, init) {
        Ok(shared) => shared,
        Err(err) => handle_alloc_error(err.layout()),
    }
}

/// Fallible form of [`make_shared`].
pub fn try_make_shared<T>(value: T) -> Result<Shared<T>, AllocError> {
    try_allocate_shared(Global, value)
}

/// Fallible form of [`allocate_shared`].
pub fn try_allocate_shared<T, A>(alloc: A, value: T) -> Result<Shared<T>, AllocError>
where
    A: Allocator + 'static,
{
    try_allocate_shared_with(alloc, move || value)
}

/// Fallible form of [`allocate_shared_with`]. `init` is not called if allocation fails.
pub fn try_allocate_shared_with<T, A, F>(alloc: A, init: F) -> Result<Shared<T>, AllocError>
where
    A: Allocator + 'static,
    F: FnOnce() -> T,
{
    let (block, ptr) = CombinedBlock::allocate_with(alloc, init)?;

    Ok(unsafe { Shared::from_inner(Raw { block, ptr }) })
}
