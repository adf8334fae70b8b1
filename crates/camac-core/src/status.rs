//! Per-thread "last error" tracking.
//!
//! Every public operation clears the calling thread's last error on entry and
//! stores the failure classification on exit, mirroring the ESONE `ctstat`
//! convention. The value is thread-local, so concurrent callers never see each
//! other's failures.

use crate::error::{CamacError, Result};
use std::cell::Cell;

thread_local! {
    static LAST_ERROR: Cell<Option<CamacError>> = const { Cell::new(None) };
}

/// Error from the most recent failed operation on this thread, if any.
pub fn last_error() -> Option<CamacError> {
    LAST_ERROR.with(Cell::get)
}

/// ESONE status number of the last error, or `0` for success.
pub fn last_status_code() -> u16 {
    last_error().and_then(|e| e.status_code()).unwrap_or(0)
}

pub(crate) fn clear() {
    LAST_ERROR.with(|cell| cell.set(None));
}

/// Store the failure (if any) and hand the result back unchanged.
pub(crate) fn track<T>(result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        LAST_ERROR.with(|cell| cell.set(Some(*err)));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_sets_and_clear_resets() {
        clear();
        assert_eq!(last_error(), None);

        let _ = track::<()>(Err(CamacError::NoQ));
        assert_eq!(last_error(), Some(CamacError::NoQ));
        assert_eq!(last_status_code(), 1);

        let _ = track(Ok(5));
        assert_eq!(last_error(), Some(CamacError::NoQ), "success must not overwrite");

        clear();
        assert_eq!(last_status_code(), 0);
    }

    #[test]
    fn test_last_error_is_per_thread() {
        let _ = track::<()>(Err(CamacError::LamTimeout));
        let other = std::thread::spawn(last_error).join().unwrap();
        assert_eq!(other, None);
        assert_eq!(last_error(), Some(CamacError::LamTimeout));
    }
}
