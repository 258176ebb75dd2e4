use std::panic::{self, AssertUnwindSafe};

/// Runs an observer callback, logging and swallowing a panic instead of letting it take down the
/// transfer or upgrade that invoked it.
pub(crate) fn invoke_guarded<F: FnOnce()>(what: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        log::error!("{what} callback panicked: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panicking_callback_is_contained() {
        let mut ran_after = false;
        invoke_guarded("test", || panic!("boom"));
        invoke_guarded("test", || ran_after = true);
        assert!(ran_after);
    }
}
