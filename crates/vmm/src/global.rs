//! Per-context singletons.
//!
//! The kernel has exactly one address translator and one frame allocator, installed
//! once during boot. In test/software-emulation mode each thread gets its own copy so
//! that every test can boot an independent emulated machine.

/// Storage for a singleton that is installed once and then shared.
#[cfg(not(any(test, feature = "software-emulation")))]
pub(crate) type Slot<T> = spin::Once<T>;

/// Storage for a singleton that is installed once per thread.
#[cfg(any(test, feature = "software-emulation"))]
pub(crate) type Slot<T> = std::thread::LocalKey<spin::Once<T>>;

/// Declares a [`Slot`] static for the current build mode.
macro_rules! global_slot {
    ($name:ident: $ty:ty) => {
        #[cfg(not(any(test, feature = "software-emulation")))]
        static $name: $crate::global::Slot<$ty> = spin::Once::new();

        #[cfg(any(test, feature = "software-emulation"))]
        std::thread_local! {
            static $name: spin::Once<$ty> = spin::Once::new();
        }
    };
}

pub(crate) use global_slot;

/// Installs `value` into `slot`.
///
/// # Panics
///
/// Panics if the slot has already been filled; `what` names the singleton in the message.
#[cfg(not(any(test, feature = "software-emulation")))]
pub(crate) fn install<T>(slot: &'static Slot<T>, value: T, what: &str) {
    if slot.get().is_some() {
        panic!("{what} already set");
    }
    slot.call_once(|| value);
}

/// Returns the value installed in `slot`, if any.
#[cfg(not(any(test, feature = "software-emulation")))]
pub(crate) fn get<T>(slot: &'static Slot<T>) -> Option<&'static T> {
    slot.get()
}

/// Installs `value` into this thread's copy of `slot`.
///
/// # Panics
///
/// Panics if the slot has already been filled; `what` names the singleton in the message.
#[cfg(any(test, feature = "software-emulation"))]
pub(crate) fn install<T: 'static>(slot: &'static Slot<T>, value: T, what: &str) {
    slot.with(|s| {
        if s.get().is_some() {
            panic!("{what} already set");
        }
        s.call_once(|| value);
    });
}

/// Returns the value installed in this thread's copy of `slot`, if any.
#[cfg(any(test, feature = "software-emulation"))]
pub(crate) fn get<T: 'static>(slot: &'static Slot<T>) -> Option<&'static T> {
    slot.with(|s| {
        // SAFETY: We leak the reference to make it 'static. This is sound because:
        // 1. Each thread has its own slot, so no other thread can observe it
        // 2. Once set, it's never modified (spin::Once guarantees this)
        // 3. The thread-local lives for the entire duration of the thread
        s.get().map(|value| unsafe { &*(value as *const T) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    global_slot!(NUMBER: u32);

    #[test]
    fn empty_until_installed() {
        assert!(get(&NUMBER).is_none());
        install(&NUMBER, 7, "number");
        assert_eq!(get(&NUMBER), Some(&7));
    }

    #[test]
    #[should_panic(expected = "number already set")]
    fn refuses_second_install() {
        install(&NUMBER, 1, "number");
        install(&NUMBER, 2, "number");
    }

    #[test]
    fn threads_do_not_share_slots() {
        install(&NUMBER, 1, "number");
        std::thread::spawn(|| assert!(get(&NUMBER).is_none()))
            .join()
            .unwrap();
    }
}
