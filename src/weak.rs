use std::{fmt, marker::PhantomData, mem, ptr::NonNull};

use crate::{
    derives::Derives,
    shared::{Raw, Shared},
};

/// A non-owning handle to the block of a [`Shared`].
///
/// A `Weak` keeps the control block allocated but never the pointee. The pointee can only be
/// reached by promoting the handle with [`lock`][Weak::lock] or [`upgrade`][Weak::upgrade], which
/// succeed while at least one `Shared` is still alive.
///
/// ```
/// # use tally::make_shared;
/// let s = make_shared(5);
/// let w = s.downgrade();
///
/// assert!(*w.lock() == 5);
/// assert!(!w.expired());
///
/// drop(s);
/// assert!(w.expired());
/// assert!(w.lock().is_null());
/// ```
pub struct Weak<T>
where
    T: ?Sized,
{
    inner: Option<Raw<T>>,
    _marker: PhantomData<T>,
}

impl<T> Weak<T>
where
    T: ?Sized,
{
    /// Creates a weak handle bound to nothing. It is always expired.
    pub const fn new() -> Self {
        Weak {
            inner: None,
            _marker: PhantomData,
        }
    }

    /// Creates a weak handle to the block of `shared`, viewed as a compatible type.
    pub fn from_shared<Y>(shared: &Shared<Y>) -> Self
    where
        Y: Derives<T> + ?Sized,
    {
        match shared.inner() {
            Some(raw) => {
                raw.block.acquire_weak();
                Weak {
                    inner: Some(raw.cast()),
                    _marker: PhantomData,
                }
            }
            None => Self::new(),
        }
    }

    /// Whether the pointee is gone. True for a null handle.
    pub fn expired(&self) -> bool {
        self.inner.map_or(true, |raw| raw.block.strong() == 0)
    }

    /// Promotes to a strong handle, or returns a null handle if the pointee is gone.
    pub fn lock(&self) -> Shared<T> {
        self.upgrade().unwrap_or_default()
    }

    /// Promotes to a strong handle. Returns `None` if the pointee is gone.
    ///
    /// ```
    /// # use tally::make_shared;
    /// let s = make_shared(String::from("a"));
    /// let w = s.downgrade();
    ///
    /// let again = w.upgrade().unwrap();
    /// assert!(s.use_count() == 2);
    ///
    /// drop(again);
    /// drop(s);
    /// assert!(w.upgrade().is_none());
    /// ```
    pub fn upgrade(&self) -> Option<Shared<T>> {
        let raw = self.inner?;
        if raw.block.strong() == 0 {
            return None;
        }

        raw.block.acquire_strong();
        Some(unsafe { Shared::from_inner(raw) })
    }

    /// Number of strong handles still bound to the block. 0 once expired or when null.
    pub fn use_count(&self) -> usize {
        self.inner.map_or(0, |raw| raw.block.strong())
    }

    /// Number of weak handles bound to the block, `self` included.
    pub fn weak_count(&self) -> usize {
        self.inner.map_or(0, |raw| raw.block.weak())
    }

    /// Converts into a weak handle of a compatible type.
    pub fn upcast<U>(mut self) -> Weak<U>
    where
        T: Derives<U>,
        U: ?Sized,
    {
        Weak {
            inner: self.inner.take().map(Raw::cast),
            _marker: PhantomData,
        }
    }

    /// Makes `self` observe `other`'s block, releasing the previous binding afterwards.
    pub fn assign<Y>(&mut self, other: &Weak<Y>)
    where
        Y: Derives<T> + ?Sized,
    {
        let mut replacement = other.clone().upcast();
        self.swap(&mut replacement);
    }

    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(&mut self.inner, &mut other.inner);
    }

    pub fn reset(&mut self) {
        let mut old = Self::new();
        self.swap(&mut old);
    }

    /// The cached pointee address. It must not be read through unless the handle is alive.
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.inner.map(|raw| raw.ptr)
    }

    /// Whether both handles observe the same block. Two null handles are equal.
    pub fn ptr_eq<U>(&self, other: &Weak<U>) -> bool
    where
        U: ?Sized,
    {
        self.inner.map(|raw| raw.block) == other.inner.map(|raw| raw.block)
    }
}

impl<T> Clone for Weak<T>
where
    T: ?Sized,
{
    fn clone(&self) -> Self {
        if let Some(raw) = self.inner {
            raw.block.acquire_weak();
        }

        Weak {
            inner: self.inner,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Weak<T>
where
    T: ?Sized,
{
    fn drop(&mut self) {
        if let Some(raw) = self.inner.take() {
            unsafe { raw.block.release_weak() };
        }
    }
}

impl<T> Default for Weak<T>
where
    T: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<&Shared<T>> for Weak<T>
where
    T: ?Sized,
{
    fn from(shared: &Shared<T>) -> Self {
        Self::from_shared(shared)
    }
}

/// Prints `(Weak)` without promoting, since the pointee may be gone.
impl<T> fmt::Debug for Weak<T>
where
    T: ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}
