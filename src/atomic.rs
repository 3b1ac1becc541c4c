// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-variable atomics with the memory orderings spelled out in the
// method name. Backed exclusively by the native `std::sync::atomic` types, so
// an `Atomic<T>` has the size and alignment of `T` and may be placed in
// memory shared between processes.

use std::fmt;
use std::sync::atomic::{self, Ordering};

mod sealed {
    pub trait Sealed {}
}

/// A value type with a native atomic counterpart.
///
/// Implemented for `bool`, the integer types the target supports atomically
/// and raw pointers. Types without a native atomic representation are
/// rejected at compile time.
pub trait AtomicValue: Copy + sealed::Sealed {
    #[doc(hidden)]
    type Repr: Send + Sync;

    #[doc(hidden)]
    fn new_repr(v: Self) -> Self::Repr;
    #[doc(hidden)]
    fn into_value(repr: Self::Repr) -> Self;
    #[doc(hidden)]
    fn load(repr: &Self::Repr, order: Ordering) -> Self;
    #[doc(hidden)]
    fn store(repr: &Self::Repr, v: Self, order: Ordering);
    #[doc(hidden)]
    fn swap(repr: &Self::Repr, v: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn compare_exchange_weak(
        repr: &Self::Repr,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self>;
}

/// An integer [`AtomicValue`] supporting wrapping add/sub.
pub trait AtomicInteger: AtomicValue {
    #[doc(hidden)]
    fn fetch_add(repr: &Self::Repr, v: Self, order: Ordering) -> Self;
    #[doc(hidden)]
    fn fetch_sub(repr: &Self::Repr, v: Self, order: Ordering) -> Self;
}

macro_rules! impl_atomic_value {
    ($($t:ty => $repr:ty, $cfg:literal;)*) => {$(
        #[cfg(target_has_atomic = $cfg)]
        impl sealed::Sealed for $t {}

        #[cfg(target_has_atomic = $cfg)]
        impl AtomicValue for $t {
            type Repr = $repr;

            #[inline]
            fn new_repr(v: Self) -> Self::Repr {
                <$repr>::new(v)
            }
            #[inline]
            fn into_value(repr: Self::Repr) -> Self {
                repr.into_inner()
            }
            #[inline]
            fn load(repr: &Self::Repr, order: Ordering) -> Self {
                repr.load(order)
            }
            #[inline]
            fn store(repr: &Self::Repr, v: Self, order: Ordering) {
                repr.store(v, order)
            }
            #[inline]
            fn swap(repr: &Self::Repr, v: Self, order: Ordering) -> Self {
                repr.swap(v, order)
            }
            #[inline]
            fn compare_exchange_weak(
                repr: &Self::Repr,
                current: Self,
                new: Self,
                success: Ordering,
                failure: Ordering,
            ) -> Result<Self, Self> {
                repr.compare_exchange_weak(current, new, success, failure)
            }
        }
    )*};
}

macro_rules! impl_atomic_integer {
    ($($t:ty, $cfg:literal;)*) => {$(
        #[cfg(target_has_atomic = $cfg)]
        impl AtomicInteger for $t {
            #[inline]
            fn fetch_add(repr: &Self::Repr, v: Self, order: Ordering) -> Self {
                repr.fetch_add(v, order)
            }
            #[inline]
            fn fetch_sub(repr: &Self::Repr, v: Self, order: Ordering) -> Self {
                repr.fetch_sub(v, order)
            }
        }
    )*};
}

impl_atomic_value! {
    bool => atomic::AtomicBool, "8";
    u8 => atomic::AtomicU8, "8";
    i8 => atomic::AtomicI8, "8";
    u16 => atomic::AtomicU16, "16";
    i16 => atomic::AtomicI16, "16";
    u32 => atomic::AtomicU32, "32";
    i32 => atomic::AtomicI32, "32";
    u64 => atomic::AtomicU64, "64";
    i64 => atomic::AtomicI64, "64";
    usize => atomic::AtomicUsize, "ptr";
    isize => atomic::AtomicIsize, "ptr";
}

impl_atomic_integer! {
    u8, "8";
    i8, "8";
    u16, "16";
    i16, "16";
    u32, "32";
    i32, "32";
    u64, "64";
    i64, "64";
    usize, "ptr";
    isize, "ptr";
}

impl<P> sealed::Sealed for *mut P {}

// Raw pointers are not `Send`, but the atomic cell holding one is.
impl<P> AtomicValue for *mut P {
    type Repr = atomic::AtomicPtr<P>;

    #[inline]
    fn new_repr(v: Self) -> Self::Repr {
        atomic::AtomicPtr::new(v)
    }
    #[inline]
    fn into_value(repr: Self::Repr) -> Self {
        repr.into_inner()
    }
    #[inline]
    fn load(repr: &Self::Repr, order: Ordering) -> Self {
        repr.load(order)
    }
    #[inline]
    fn store(repr: &Self::Repr, v: Self, order: Ordering) {
        repr.store(v, order)
    }
    #[inline]
    fn swap(repr: &Self::Repr, v: Self, order: Ordering) -> Self {
        repr.swap(v, order)
    }
    #[inline]
    fn compare_exchange_weak(
        repr: &Self::Repr,
        current: Self,
        new: Self,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Self, Self> {
        repr.compare_exchange_weak(current, new, success, failure)
    }
}

/// An atomic variable with explicit memory ordering per operation.
///
/// Unsuffixed operations are sequentially consistent. `_acquire` keeps later
/// memory operations from moving before the atomic operation, `_release` keeps
/// earlier ones from moving after it, and `_relaxed` only guarantees
/// atomicity.
///
/// Intended for lock-free signaling between threads (shutdown flags,
/// reference counts) and for counters living in shared memory. Every
/// read-modify-write is a single atomic instruction sequence; there is no way
/// to split one into a separate load and store.
#[repr(transparent)]
pub struct Atomic<T: AtomicValue> {
    state: T::Repr,
}

impl<T: AtomicValue> Atomic<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: T::new_repr(value),
        }
    }

    pub fn into_inner(self) -> T {
        T::into_value(self.state)
    }

    #[inline]
    pub fn load(&self) -> T {
        T::load(&self.state, Ordering::SeqCst)
    }

    #[inline]
    pub fn load_acquire(&self) -> T {
        T::load(&self.state, Ordering::Acquire)
    }

    #[inline]
    pub fn load_relaxed(&self) -> T {
        T::load(&self.state, Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, value: T) {
        T::store(&self.state, value, Ordering::SeqCst)
    }

    #[inline]
    pub fn store_release(&self, value: T) {
        T::store(&self.state, value, Ordering::Release)
    }

    #[inline]
    pub fn store_relaxed(&self, value: T) {
        T::store(&self.state, value, Ordering::Relaxed)
    }

    /// Weak compare-and-swap.
    ///
    /// Replaces the value with `desired` if it equals `*expected` and returns
    /// true. Otherwise writes the value observed at the moment of the attempt
    /// into `*expected` and returns false. May fail spuriously even when the
    /// values compare equal, so callers retry in a loop.
    #[inline]
    pub fn compare_and_swap(&self, expected: &mut T, desired: T) -> bool {
        match T::compare_exchange_weak(
            &self.state,
            *expected,
            desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(actual) => {
                *expected = actual;
                false
            }
        }
    }

    /// Store `value` and return the previous value, with acquire ordering.
    #[inline]
    pub fn exchange_acquire(&self, value: T) -> T {
        T::swap(&self.state, value, Ordering::Acquire)
    }
}

impl<T: AtomicInteger> Atomic<T> {
    #[inline]
    pub fn fetch_add_acquire(&self, v: T) -> T {
        T::fetch_add(&self.state, v, Ordering::Acquire)
    }

    #[inline]
    pub fn fetch_add_release(&self, v: T) -> T {
        T::fetch_add(&self.state, v, Ordering::Release)
    }

    #[inline]
    pub fn fetch_sub_relaxed(&self, v: T) -> T {
        T::fetch_sub(&self.state, v, Ordering::Relaxed)
    }

    #[inline]
    pub fn fetch_sub_acquire(&self, v: T) -> T {
        T::fetch_sub(&self.state, v, Ordering::Acquire)
    }

    #[inline]
    pub fn fetch_sub_release(&self, v: T) -> T {
        T::fetch_sub(&self.state, v, Ordering::Release)
    }
}

impl<T: AtomicValue + Default> Default for Atomic<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: AtomicValue> From<T> for Atomic<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: AtomicValue + fmt::Debug> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Atomic").field(&self.load_relaxed()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_layout_as_value() {
        assert_eq!(std::mem::size_of::<Atomic<u64>>(), 8);
        assert_eq!(std::mem::align_of::<Atomic<u64>>(), 8);
        assert_eq!(std::mem::size_of::<Atomic<u32>>(), 4);
        assert_eq!(std::mem::size_of::<Atomic<bool>>(), 1);
    }

    #[test]
    fn debug_shows_value() {
        let a = Atomic::new(42u32);
        assert_eq!(format!("{a:?}"), "Atomic(42)");
    }
}
