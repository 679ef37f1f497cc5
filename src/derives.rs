use std::ptr::NonNull;

/// `Self` can be viewed as a `Base`: a pointer to `Self` converts to a pointer to `Base` inside
/// the same allocation. Handles use this bound for every conversion between pointee types, so an
/// incompatible conversion fails to compile.
///
/// Every type derives from itself. Other relations are declared with [`derives!`], either as an
/// unsizing coercion (`Circle => dyn Shape`) or as an embedded field (`Button => Widget, widget`).
///
/// ```compile_fail
/// # use tally::make_shared;
/// let s = make_shared(String::from("text"));
/// let n: tally::Shared<u32> = s.upcast();
/// ```
///
/// # Safety
///
/// `upcast` must not read through its argument, which may dangle, and must return an address
/// inside the pointee. `Self` must not borrow anything that `Base` does not.
pub unsafe trait Derives<Base>
where
    Base: ?Sized,
{
    fn upcast(this: NonNull<Self>) -> NonNull<Base>;
}

unsafe impl<T> Derives<T> for T
where
    T: ?Sized,
{
    fn upcast(this: NonNull<Self>) -> NonNull<T> {
        this
    }
}

/// Declares that one type may be handled as another.
///
/// ```
/// use std::cell::Cell;
/// use tally::{derives, make_shared, Shared};
///
/// trait Shape {
///     fn area(&self) -> f64;
/// }
///
/// struct Square(f64);
///
/// impl Shape for Square {
///     fn area(&self) -> f64 {
///         self.0 * self.0
///     }
/// }
///
/// derives!(Square => dyn Shape);
///
/// struct Counter {
///     hits: Cell<u32>,
/// }
///
/// struct Page {
///     title: &'static str,
///     counter: Counter,
/// }
///
/// derives!(Page => Counter, counter);
///
/// let shape: Shared<dyn Shape> = make_shared(Square(2.0)).upcast();
/// assert!(shape.area() == 4.0);
///
/// let page = make_shared(Page { title: "home", counter: Counter { hits: Cell::new(0) } });
/// let counter: Shared<Counter> = page.upcast_ref();
/// counter.hits.set(3);
/// assert!(page.counter.hits.get() == 3);
/// assert!(page.use_count() == 2);
/// ```
///
/// The field form needs a field of exactly the base type. A field that only dereferences to it,
/// such as a `Box<Base>`, is rejected:
///
/// ```compile_fail
/// # use tally::derives;
/// struct Inner {
///     id: u32,
/// }
///
/// struct Outer {
///     boxed: Box<Inner>,
/// }
///
/// derives!(Outer => Inner, boxed);
/// ```
#[macro_export]
macro_rules! derives {
    ($derived:ty => $base:ty, $field:ident) => {
        unsafe impl $crate::Derives<$base> for $derived {
            fn upcast(this: ::core::ptr::NonNull<Self>) -> ::core::ptr::NonNull<$base> {
                let _ = |p: *const $derived| -> *const $base {
                    unsafe { ::core::ptr::addr_of!((*p).$field) }
                };

                let offset = ::core::mem::offset_of!($derived, $field);
                unsafe {
                    ::core::ptr::NonNull::new_unchecked(
                        this.as_ptr().cast::<u8>().wrapping_add(offset).cast::<$base>(),
                    )
                }
            }
        }
    };
    ($derived:ty => $base:ty) => {
        unsafe impl $crate::Derives<$base> for $derived {
            fn upcast(this: ::core::ptr::NonNull<Self>) -> ::core::ptr::NonNull<$base> {
                this
            }
        }
    };
}
