//! Scopes bounding the lifetime of partitioned requests
//!
//! The persistent channels of a partitioned request keep raw pointers into the buffer of the
//! message until they are released. Running the destructor of the request releases them, but
//! destructors are not guaranteed to run: a request passed to `mem::forget()` would leave the
//! transport writing into (or reading from) a buffer whose borrow has ended.
//!
//! Every partitioned request is therefore registered with a [`Scope`](trait.Scope.html) that
//! outlives the borrow of its buffer:
//!
//! - [`scope()`](fn.scope.html) provides a `LocalScope` for buffers declared outside of the
//!   closure. The buffers stay borrowed until `scope()` returns.
//! - [`StaticScope`](struct.StaticScope.html) is used with `'static` buffers, which may outlive
//!   any request.
//!
//! # Aborts
//!
//! If a `LocalScope` ends while requests registered with it have not been freed or dropped, the
//! process is aborted. The transport may still access buffers that are about to be released.

use std::marker::PhantomData;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::error;

/// A common interface for [`LocalScope`](struct.LocalScope.html) and
/// [`StaticScope`](struct.StaticScope.html)
///
/// # Safety
///
/// An implementation for lifetime `'a` must guarantee that no buffer of a request registered with
/// it is released while the request is still registered. This holds for `'static` buffers and for
/// scopes that never end with registered requests.
pub unsafe trait Scope<'a> {
    /// Registers a request with the scope.
    fn register(&self);

    /// Unregisters a request from the scope.
    ///
    /// # Safety
    ///
    /// Must only be called once per registered request, after all of its channels have been
    /// released.
    unsafe fn unregister(&self);
}

/// The scope that lasts as long as the entire execution of the program
///
/// Requests registered with a `StaticScope` borrow their buffers for `'static`, so leaking them
/// leaks the buffer too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StaticScope;

unsafe impl Scope<'static> for StaticScope {
    fn register(&self) {}

    unsafe fn unregister(&self) {}
}

/// A temporary scope that lasts no more than the lifetime `'a`
///
/// To obtain a `LocalScope`, use the [`scope`](fn.scope.html) function. Buffers of requests
/// registered with a `LocalScope<'a>` are borrowed for `'a`.
///
/// # Aborts
///
/// When a `LocalScope` is dropped while requests are still registered with it.
///
/// # Examples
///
/// A leaked request keeps its buffer borrowed until the end of the scope:
///
/// ```compile_fail
/// use std::mem;
/// use mpi_partitioned::transport::local::LocalUniverse;
/// use mpi_partitioned::{scope, PartitionedRequest};
///
/// let universe = LocalUniverse::new(1);
/// let group = universe.group(0).unwrap();
/// let mut halo = vec![0u8; 8];
///
/// scope(|scope| {
///     let request = PartitionedRequest::recv_init(scope, &group, &mut halo, 1, 8, 0, 0).unwrap();
///     mem::forget(request);
///     drop(halo);
/// });
/// ```
#[derive(Debug)]
pub struct LocalScope<'a> {
    num_requests: AtomicUsize,
    // Invariant in 'a, without giving up `Sync`.
    phantom: PhantomData<fn(&'a ()) -> &'a ()>,
}

impl<'a> LocalScope<'a> {
    /// Number of requests currently registered with the scope
    pub fn requests(&self) -> usize {
        self.num_requests.load(Ordering::Acquire)
    }
}

impl<'a> Drop for LocalScope<'a> {
    fn drop(&mut self) {
        let lingering = *self.num_requests.get_mut();
        if lingering != 0 {
            error!(
                "{} partitioned request(s) leaked, their channels still reference borrowed buffers",
                lingering
            );
            process::abort();
        }
    }
}

unsafe impl<'a, 'b> Scope<'a> for &'b LocalScope<'a> {
    fn register(&self) {
        self.num_requests.fetch_add(1, Ordering::AcqRel);
    }

    unsafe fn unregister(&self) {
        let previous = self.num_requests.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unregister has been called more times than register");
    }
}

/// Used to create a [`LocalScope`](struct.LocalScope.html)
///
/// The function creates a `LocalScope` and passes it into the given closure. Buffers of the
/// requests registered with the scope must be declared *outside* of the closure, they remain
/// borrowed until the function returns.
///
/// ```
/// use mpi_partitioned::transport::local::LocalUniverse;
/// use mpi_partitioned::{scope, PartitionedRequest};
///
/// let universe = LocalUniverse::new(1);
/// let group = universe.group(0).unwrap();
/// let mut data = [0u8; 8];
///
/// scope(|scope| {
///     let request =
///         PartitionedRequest::send_init(scope, &group, &mut data, 2, 4, 0, 0).unwrap();
///     assert_eq!(scope.requests(), 1);
///     request.free().unwrap();
///     assert_eq!(scope.requests(), 0);
/// });
/// ```
pub fn scope<'a, F, R>(f: F) -> R
where
    F: FnOnce(&LocalScope<'a>) -> R,
{
    f(&LocalScope {
        num_requests: AtomicUsize::new(0),
        phantom: PhantomData,
    })
}
