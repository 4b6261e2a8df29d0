//! Cursor abstraction shared by every log
//!
//! A cursor starts before its first record: callers must `advance()` once
//! before `record()` returns anything. "No record available" is a normal
//! `Ok(false)` return, never an error.

use std::marker::PhantomData;

use changelog_core::ChangelogResult;

/// Forward-only cursor over log records
pub trait ChangelogCursor: Send {
    /// Type of the records yielded
    type Item;

    /// Move to the next record. Returns false when none is available now.
    fn advance(&mut self) -> ChangelogResult<bool>;

    /// Record the cursor is positioned on, if any
    fn record(&self) -> Option<&Self::Item>;

    /// Release the resources held by the cursor. Idempotent.
    fn close(&mut self);
}

/// Cursor that never yields anything
#[derive(Debug)]
pub struct EmptyCursor<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> EmptyCursor<T> {
    /// Create an empty cursor
    pub fn new() -> Self {
        EmptyCursor {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for EmptyCursor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChangelogCursor for EmptyCursor<T> {
    type Item = T;

    fn advance(&mut self) -> ChangelogResult<bool> {
        Ok(false)
    }

    fn record(&self) -> Option<&T> {
        None
    }

    fn close(&mut self) {}
}
