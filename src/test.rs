use crate::{
    allocate_shared, allocate_shared_with, make_shared, make_shared_with, try_allocate_shared,
    try_allocate_shared_with, try_make_shared, AllocError, Allocator, Global, Shared, Weak,
};
#[cfg(feature = "pool")]
use crate::{block::CombinedBlock, Pool};
use std::{
    alloc::Layout,
    cell::{Cell, RefCell},
    mem::{self, drop},
    panic::{self, AssertUnwindSafe},
    ptr::{self, NonNull},
    rc::Rc,
};

struct Tracked {
    value: i32,
    drops: Rc<Cell<usize>>,
}

impl Tracked {
    fn new(value: i32, drops: &Rc<Cell<usize>>) -> Self {
        Tracked {
            value,
            drops: Rc::clone(drops),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.set(self.drops.get() + 1);
    }
}

#[derive(Default)]
struct Stats {
    allocs: Cell<usize>,
    frees: Cell<usize>,
    events: RefCell<Vec<&'static str>>,
}

#[derive(Clone, Default)]
struct Counting(Rc<Stats>);

impl Counting {
    fn allocs(&self) -> usize {
        self.0.allocs.get()
    }

    fn frees(&self) -> usize {
        self.0.frees.get()
    }

    fn events(&self) -> Vec<&'static str> {
        self.0.events.borrow().clone()
    }
}

unsafe impl Allocator for Counting {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        self.0.allocs.set(self.0.allocs.get() + 1);
        Global.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.0.frees.set(self.0.frees.get() + 1);
        self.0.events.borrow_mut().push("destroy");
        Global.deallocate(ptr, layout)
    }
}

struct Exhausted;

unsafe impl Allocator for Exhausted {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError::new(layout))
    }

    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
        unreachable!()
    }
}

trait Shape {
    fn area(&self) -> f64;
}

struct Circle {
    radius: f64,
}

impl Shape for Circle {
    fn area(&self) -> f64 {
        3.0 * self.radius * self.radius
    }
}

crate::derives!(Circle => dyn Shape);

struct Base {
    id: u32,
}

struct Derived {
    _tag: u8,
    base: Base,
}

crate::derives!(Derived => Base, base);

struct Holder {
    boxed: Box<Base>,
    base: Base,
}

crate::derives!(Holder => Base, base);

#[test]
fn t001() {
    let drops = Rc::new(Cell::new(0));
    let a = make_shared(Tracked::new(5, &drops));
    let b = a.clone();

    assert!(a.use_count() == 2);
    assert!(b.use_count() == 2);
    assert!(b.value == 5);

    drop(b);
    assert!(a.use_count() == 1);
    assert!(drops.get() == 0);

    drop(a);
    assert!(drops.get() == 1);
}

#[test]
fn t002() {
    let drops = Rc::new(Cell::new(0));
    let a = Shared::from_box(Box::new(Tracked::new(5, &drops)));
    let b = a.clone();
    let c = b.clone();

    assert!(c.use_count() == 3);
    drop(a);
    drop(c);
    assert!(b.use_count() == 1);
    assert!(drops.get() == 0);

    drop(b);
    assert!(drops.get() == 1);
}

#[test]
fn t003() {
    let a = make_shared(Cell::new(5));
    let b = a.clone();
    let c = Shared::<Cell<i32>>::from_box(Box::new(Cell::new(7)));

    assert!(a.get().unwrap().get() == 5);
    b.set(6);
    assert!(a.get().unwrap().get() == 6);
    assert!(c.get().unwrap().get() == 7);

    let s = make_shared_with(|| String::from("built in place"));
    assert!(&*s == "built in place");
}

#[test]
fn t004() {
    let first = make_shared(vec![0u8; 16]);

    {
        let mut ptrs = vec![first.clone(); 10];
        for _ in 0..100_000 {
            ptrs.push(ptrs.last().unwrap().clone());
            let copy = Shared::clone(ptrs.last().unwrap());
            ptrs.push(copy);
        }

        assert!(first.use_count() == 1 + 10 + 200_000);

        ptrs.clear();
        assert!(first.use_count() == 1);
    }

    assert!(first.use_count() == 1);
}

#[test]
fn t005() {
    let mut first = Shared::from_box(Box::new(vec![0; 1000]));
    first.get_mut().unwrap()[0] = 1;

    let mut second = Shared::from_box(Box::new((*first).clone()));
    second.get_mut().unwrap()[0] = 2;

    for _ in 0..1_000_000 {
        first.swap(&mut second);
    }
    mem::swap(first.get_mut().unwrap(), second.get_mut().unwrap());

    assert!(first[0] == 2);
    assert!(second[0] == 1);
    assert!(first.use_count() == 1);
    assert!(second.use_count() == 1);

    for _ in 0..10 {
        let mut third = Shared::from_box(Box::new((*first).clone()));
        let mut fourth = second.clone();
        fourth.swap(&mut third);
        assert!(second.use_count() == 2);
    }

    assert!(second.use_count() == 1);
}

#[test]
fn t006() {
    let drops = Rc::new(Cell::new(0));
    let mut first = make_shared(Tracked::new(1, &drops));
    let mut second = first.clone();

    first.reset_box(Box::new(Tracked::new(2, &drops)));
    assert!(first.value == 2);
    assert!(second.use_count() == 1);
    assert!(drops.get() == 0);

    second.reset();
    assert!(second.is_null());
    assert!(second.get().is_none());
    assert!(drops.get() == 1);

    Shared::<Tracked>::null().swap(&mut first);
    assert!(first.get().is_none());
    assert!(first.use_count() == 0);
    assert!(drops.get() == 2);
}

#[test]
fn t007() {
    let mut seed = 12345u32;
    let mut ptrs: Vec<Shared<u32>> = (0..100_000)
        .map(|_| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            Shared::from_box(Box::new(seed % 99_999))
        })
        .collect();

    ptrs.sort();
    assert!(ptrs.windows(2).all(|w| *w[0] <= *w[1]));

    while ptrs.pop().is_some() {}
}

#[test]
fn t008() {
    let s = make_shared(5);
    let weaks: Vec<Weak<i32>> = (0..8).map(|_| s.downgrade()).collect();
    let t = s.clone();

    assert!(s.weak_count() == 8);
    assert!(weaks.iter().all(|w| !w.expired()));

    drop(s);
    assert!(weaks.iter().all(|w| !w.expired()));

    drop(t);
    assert!(weaks.iter().all(Weak::expired));
    assert!(weaks[0].weak_count() == 8);
}

#[test]
fn t009() {
    let s = make_shared(String::from("a"));
    let w = Weak::from(&s);

    let before = s.use_count();
    let locked = w.lock();
    assert!(s.use_count() == before + 1);
    assert!(locked.ptr_eq(&s));
    assert!(&*locked == "a");

    drop(locked);
    drop(s);
    assert!(w.use_count() == 0);
    assert!(w.lock().is_null());
    assert!(w.upgrade().is_none());
}

#[test]
fn t010() {
    let alloc = Counting::default();
    let drops = Rc::new(Cell::new(0));

    let s = allocate_shared(alloc.clone(), Tracked::new(1, &drops));
    assert!(alloc.allocs() == 1);

    let w1 = s.downgrade();
    let w2 = w1.clone();

    drop(s);
    assert!(drops.get() == 1);
    assert!(alloc.frees() == 0);

    drop(w1);
    assert!(alloc.frees() == 0);

    drop(w2);
    assert!(alloc.frees() == 1);
    assert!(drops.get() == 1);
}

#[test]
fn t011() {
    let alloc = Counting::default();
    let stats = alloc.clone();
    let deleted = Rc::new(Cell::new(0));

    let raw = Box::into_raw(Box::new(5));
    let s: Shared<i32> = unsafe {
        let deleted = Rc::clone(&deleted);
        let stats = stats.clone();
        Shared::from_raw_in(
            raw,
            move |ptr: NonNull<i32>| {
                deleted.set(deleted.get() + 1);
                stats.0.events.borrow_mut().push("dispose");
                drop(Box::from_raw(ptr.as_ptr()));
            },
            alloc,
        )
    };

    assert!(*s == 5);
    assert!(s.as_ptr() == NonNull::new(raw));
    assert!(stats.allocs() == 1);

    let w = s.downgrade();
    drop(s);
    assert!(deleted.get() == 1);
    assert!(stats.frees() == 0);

    drop(w);
    assert!(deleted.get() == 1);
    assert!(stats.events() == ["dispose", "destroy"]);
}

#[test]
fn t012() {
    let circle = make_shared(Circle { radius: 1.0 });
    let shape: Shared<dyn Shape> = circle.upcast_ref();

    assert!(shape.area() == 3.0);
    assert!(circle.use_count() == 2);
    assert!(shape.ptr_eq(&circle));

    let boxed = Shared::<dyn Shape>::from_box(Box::new(Circle { radius: 2.0 }));
    assert!(boxed.area() == 12.0);

    let mut slot: Shared<dyn Shape> = Shared::null();
    slot.assign(&circle);
    assert!(circle.use_count() == 3);

    let weak: Weak<dyn Shape> = Weak::from_shared(&circle);
    drop(circle);
    drop(shape);
    assert!(!weak.expired());
    assert!(weak.lock().area() == 3.0);

    slot.assign_from(boxed);
    assert!(weak.expired());
    assert!(slot.area() == 12.0);
}

#[test]
fn t013() {
    let derived = make_shared(Derived {
        _tag: 1,
        base: Base { id: 7 },
    });
    let base: Shared<Base> = derived.upcast_ref();

    assert!(base.id == 7);
    assert!(base.as_ptr() == Some(NonNull::from(&derived.base)));
    assert!(derived.use_count() == 2);

    let weak = derived.downgrade().upcast::<Base>();
    drop(derived);
    assert!(weak.lock().id == 7);

    drop(base);
    assert!(weak.expired());
}

#[test]
fn t014() {
    struct Node {
        me: RefCell<Weak<Node>>,
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            assert!(self.me.borrow().expired());
            self.drops.set(self.drops.get() + 1);
        }
    }

    let alloc = Counting::default();
    let drops = Rc::new(Cell::new(0));
    let node = allocate_shared(
        alloc.clone(),
        Node {
            me: RefCell::new(Weak::new()),
            drops: Rc::clone(&drops),
        },
    );
    *node.me.borrow_mut() = node.downgrade();
    assert!(node.weak_count() == 1);

    drop(node);
    assert!(drops.get() == 1);
    assert!(alloc.frees() == 1);
}

#[test]
fn t015() {
    let s = Shared::<i32>::null();
    assert!(s.is_null());
    assert!(s.use_count() == 0);
    assert!(s.weak_count() == 0);
    assert!(s.get().is_none());
    assert!(s.downgrade().expired());

    let w = Weak::<i32>::new();
    assert!(w.expired());
    assert!(w.lock().is_null());
    assert!(w.upgrade().is_none());

    let d = Shared::<str>::default();
    assert!(d.is_null());
    assert!(Weak::<str>::default().expired());

    let from_null = unsafe { Shared::<i32>::from_raw(ptr::null_mut::<i32>()) };
    assert!(from_null.is_null());
}

#[test]
#[should_panic(expected = "dereferenced a null `Shared`")]
fn t016() {
    let s = Shared::<i32>::null();
    let _value: i32 = *s;
}

#[test]
fn t017() {
    let drops = Rc::new(Cell::new(0));
    let a = make_shared(Tracked::new(1, &drops));
    let mut b = make_shared(Tracked::new(2, &drops));

    b.assign(&a);
    assert!(b.value == 1);
    assert!(a.use_count() == 2);
    assert!(drops.get() == 1);

    let c = b.clone();
    b.assign(&c);
    assert!(a.use_count() == 3);
    assert!(drops.get() == 1);

    let mut d = make_shared(Tracked::new(3, &drops));
    d.assign_from(c);
    assert!(a.use_count() == 3);
    assert!(drops.get() == 2);

    let moved = d;
    assert!(moved.use_count() == 3);
}

#[test]
fn t018() {
    let mut s = make_shared(1);
    assert!(s.get_mut().is_some());

    let t = s.clone();
    assert!(s.get_mut().is_none());
    drop(t);

    let w = s.downgrade();
    assert!(s.get_mut().is_none());
    drop(w);

    *s.get_mut().unwrap() = 2;
    assert!(*s == 2);
}

#[cfg(feature = "pool")]
#[test]
fn t019() {
    static POOL: Pool = Pool::new();
    let layout = Layout::new::<CombinedBlock<u64, &'static Pool>>();

    let a = allocate_shared(&POOL, 1u64);
    let addr = a.as_ptr();
    assert!(POOL.cached(layout) == 0);

    drop(a);
    assert!(POOL.cached(layout) == 1);

    let b = allocate_shared(&POOL, 2u64);
    assert!(b.as_ptr() == addr);
    assert!(*b == 2);
    assert!(POOL.cached(layout) == 0);
}

#[cfg(feature = "pool")]
#[test]
fn t020() {
    static SMALL: Pool = Pool::with_capacity(1);
    static NONE: Pool = Pool::with_capacity(0);
    let layout = Layout::new::<CombinedBlock<u32, &'static Pool>>();

    let handles: Vec<_> = (0..3).map(|i| allocate_shared(&SMALL, i as u32)).collect();
    drop(handles);
    assert!(SMALL.cached(layout) == 1);

    let handles: Vec<_> = (0..3).map(|i| allocate_shared(&NONE, i as u32)).collect();
    drop(handles);
    assert!(NONE.cached(layout) == 0);
    assert!(NONE.capacity() == 0);

    let owned = Pool::with_capacity(4);
    let s = allocate_shared(owned, 5u32);
    assert!(*s == 5);
}

#[test]
fn t021() {
    assert!(*try_make_shared(3).unwrap() == 3);

    let called = Cell::new(false);
    let err = try_allocate_shared_with(Exhausted, || called.set(true)).unwrap_err();
    assert!(!called.get());
    assert!(err.to_string() == format!("memory allocation of {} bytes failed", err.layout().size()));

    assert!(try_allocate_shared(Exhausted, 1u8).is_err());

    let drops = Rc::new(Cell::new(0));
    let boxed = Box::new(Tracked::new(1, &drops));
    assert!(Shared::<Tracked>::try_from_box_in(boxed, Exhausted).is_err());
    assert!(drops.get() == 1);
}

#[test]
fn t022() {
    let alloc = Counting::default();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        allocate_shared_with(alloc.clone(), || -> i32 { panic!("init failed") })
    }));

    assert!(result.is_err());
    assert!(alloc.allocs() == 1);
    assert!(alloc.frees() == 1);
}

#[test]
fn t023() {
    let drops = Rc::new(Cell::new(0));
    let mut s = make_shared(Tracked::new(1, &drops));

    unsafe { s.reset_raw(Box::into_raw(Box::new(Tracked::new(2, &drops)))) };
    assert!(drops.get() == 1);
    assert!(s.value == 2);

    unsafe { s.reset_raw(ptr::null_mut::<Tracked>()) };
    assert!(drops.get() == 2);
    assert!(s.is_null());
}

#[test]
fn t024() {
    let a = make_shared(3);
    let b = make_shared(3);

    assert!(a == b);
    assert!(!a.ptr_eq(&b));
    assert!(format!("{a:?}") == "3");
    assert!(format!("{a}") == "3");
    assert!(format!("{:?}", Shared::<i32>::null()) == "Shared(null)");
    assert!(format!("{:?}", a.downgrade()) == "(Weak)");

    let s: Shared<str> = Box::<str>::from("text").into();
    assert!(AsRef::<str>::as_ref(&s) == "text");
}

#[test]
fn t025() {
    let a = make_shared(1);
    let b = make_shared(2);

    let mut wa = a.downgrade();
    let mut wb = b.downgrade();
    wa.swap(&mut wb);
    assert!(*wa.lock() == 2);
    assert!(*wb.lock() == 1);

    wa.assign(&wb);
    assert!(wa.ptr_eq(&wb));
    assert!(a.weak_count() == 2);
    assert!(b.weak_count() == 0);

    wb.reset();
    assert!(wb.expired());
    assert!(a.weak_count() == 1);
}

#[test]
fn t026() {
    let holder = make_shared(Holder {
        boxed: Box::new(Base { id: 1 }),
        base: Base { id: 2 },
    });
    let base: Shared<Base> = holder.upcast_ref();

    assert!(base.id == 2);
    assert!(holder.boxed.id == 1);
    assert!(base.as_ptr() == Some(NonNull::from(&holder.base)));
}
