//! Backtraces captured where a panic happens.
//!
//! A backtrace taken after `catch_unwind` returns only shows the frames of
//! the recovering wrapper. The hook installed here captures the backtrace
//! on the panicking thread, before unwinding, and parks it in a
//! thread-local until the wrapper that caught the panic takes it.

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a capturing hook in front of the current panic hook.
///
/// Idempotent. The previous hook still runs, so the default panic message
/// is printed as before.
pub fn install_hook() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let captured = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(captured));
            previous(info);
        }));
    });
}

/// Backtrace of the latest panic on this thread.
///
/// Falls back to the current backtrace when the hook captured nothing.
pub fn take_backtrace() -> String {
    LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}
