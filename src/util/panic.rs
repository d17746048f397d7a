//! Panic payload inspection.

use std::any::Any;

/// Best-effort extraction of the message carried by a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_str_payload() {
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("boom"))).unwrap_err();
        assert_eq!(panic_message(payload), "boom");
    }

    #[test]
    fn test_string_payload() {
        let code = 7;
        let payload = catch_unwind(AssertUnwindSafe(|| panic!("code {code}"))).unwrap_err();
        assert_eq!(panic_message(payload), "code 7");
    }

    #[test]
    fn test_opaque_payload() {
        let payload = catch_unwind(AssertUnwindSafe(|| std::panic::panic_any(42u8))).unwrap_err();
        assert_eq!(panic_message(payload), "unknown panic");
    }
}
