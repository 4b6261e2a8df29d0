//! K-way merge over replica cursors
//!
//! `CompositeCursor` merges any number of update cursors into one stream
//! ordered by CSN. Each source cursor carries a tag (a replica id, or a
//! `(domain, replica id)` pair) that is exposed alongside the record.
//!
//! Sources are split into an active set, ordered by the CSN of their
//! current record, and an exhausted set of sources that had nothing to
//! offer last time they were asked. Exhausted sources are retried on every
//! `advance()`, so a source that gains new records rejoins the merge.
//!
//! The exposed record stays owned by its source until the next `advance()`,
//! which lets a consumer peek at the oldest pending update, call
//! [`CompositeCursor::refresh`] to let late records from exhausted sources
//! overtake it, and only then consume it.

use std::collections::BTreeMap;
use std::fmt::Debug;

use changelog_core::{ChangelogError, ChangelogResult, Csn, UpdateMsg};

use crate::cursor::ChangelogCursor;

/// Merging cursor over tagged update cursors
pub struct CompositeCursor<C, D>
where
    C: ChangelogCursor<Item = UpdateMsg>,
    D: Ord + Clone + Debug,
{
    /// Sources with a current record, ordered by `(csn, tag)`
    active: BTreeMap<(Csn, D), C>,
    /// Sources with no current record
    exhausted: Vec<(D, C)>,
    /// Source whose record is currently exposed
    exposed: Option<(D, C)>,
    /// Set once two sources exposed the same key; the merge stays failed
    duplicate: Option<Csn>,
}

impl<C, D> Default for CompositeCursor<C, D>
where
    C: ChangelogCursor<Item = UpdateMsg>,
    D: Ord + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, D> CompositeCursor<C, D>
where
    C: ChangelogCursor<Item = UpdateMsg>,
    D: Ord + Clone + Debug,
{
    /// Merge with no source yet
    pub fn new() -> Self {
        CompositeCursor {
            active: BTreeMap::new(),
            exhausted: Vec::new(),
            exposed: None,
            duplicate: None,
        }
    }

    /// Add a source. It is polled on the next `advance()` or `refresh()`.
    pub fn add_cursor(&mut self, tag: D, cursor: C) {
        self.exhausted.push((tag, cursor));
    }

    /// Close and drop every source whose tag matches `pred`
    pub fn remove_cursors(&mut self, mut pred: impl FnMut(&D) -> bool) {
        let drop_exposed = self.exposed.as_ref().map_or(false, |(tag, _)| pred(tag));
        if drop_exposed {
            if let Some((_, mut cursor)) = self.exposed.take() {
                cursor.close();
            }
        }

        let doomed: Vec<(Csn, D)> = self
            .active
            .keys()
            .filter(|(_, tag)| pred(tag))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(mut cursor) = self.active.remove(&key) {
                cursor.close();
            }
        }

        let mut kept = Vec::with_capacity(self.exhausted.len());
        for (tag, mut cursor) in self.exhausted.drain(..) {
            if pred(&tag) {
                cursor.close();
            } else {
                kept.push((tag, cursor));
            }
        }
        self.exhausted = kept;
    }

    /// Number of sources, whatever their state
    pub fn len(&self) -> usize {
        self.active.len() + self.exhausted.len() + usize::from(self.exposed.is_some())
    }

    /// True when the merge has no source
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tag of the source the current record came from
    pub fn data(&self) -> Option<&D> {
        self.exposed.as_ref().map(|(tag, _)| tag)
    }

    /// Reselect the oldest record without consuming the exposed one.
    ///
    /// Exhausted sources are polled once; a record they produce that is
    /// older than the exposed one takes its place.
    pub fn refresh(&mut self) -> ChangelogResult<bool> {
        self.check_duplicate()?;
        if let Some((tag, cursor)) = self.exposed.take() {
            self.file(tag, cursor)?;
        }

        let pending: Vec<(D, C)> = self.exhausted.drain(..).collect();
        let mut polled = Ok(());
        for (tag, mut cursor) in pending {
            if polled.is_err() {
                self.exhausted.push((tag, cursor));
                continue;
            }
            match cursor.advance() {
                Ok(true) => polled = self.file(tag, cursor),
                Ok(false) => self.exhausted.push((tag, cursor)),
                Err(e) => {
                    self.exhausted.push((tag, cursor));
                    polled = Err(e);
                }
            }
        }
        polled?;

        if let Some(((_, tag), cursor)) = self.active.pop_first() {
            self.exposed = Some((tag, cursor));
            return Ok(true);
        }
        Ok(false)
    }

    fn check_duplicate(&self) -> ChangelogResult<()> {
        match self.duplicate {
            Some(csn) => Err(ChangelogError::DuplicateCsn(csn)),
            None => Ok(()),
        }
    }

    /// Put a source back in the active or exhausted set.
    ///
    /// A source whose key is already active is parked in the exhausted set
    /// and the merge fails from then on.
    fn file(&mut self, tag: D, cursor: C) -> ChangelogResult<()> {
        let Some(csn) = cursor.record().map(|msg| msg.csn()) else {
            self.exhausted.push((tag, cursor));
            return Ok(());
        };
        let key = (csn, tag);
        if self.active.contains_key(&key) {
            self.exhausted.push((key.1, cursor));
            self.duplicate = Some(csn);
            return Err(ChangelogError::DuplicateCsn(csn));
        }
        self.active.insert(key, cursor);
        Ok(())
    }

    /// Close every source, active and exhausted
    pub fn close_all(&mut self) {
        if let Some((_, mut cursor)) = self.exposed.take() {
            cursor.close();
        }
        for (_, mut cursor) in std::mem::take(&mut self.active) {
            cursor.close();
        }
        for (_, mut cursor) in self.exhausted.drain(..) {
            cursor.close();
        }
    }
}

impl<C, D> ChangelogCursor for CompositeCursor<C, D>
where
    C: ChangelogCursor<Item = UpdateMsg>,
    D: Ord + Clone + Debug + Send,
{
    type Item = UpdateMsg;

    /// Consume the exposed record and expose the next oldest one
    fn advance(&mut self) -> ChangelogResult<bool> {
        self.check_duplicate()?;
        if let Some((tag, mut cursor)) = self.exposed.take() {
            if let Err(e) = cursor.advance() {
                self.exhausted.push((tag, cursor));
                return Err(e);
            }
            self.file(tag, cursor)?;
        }
        self.refresh()
    }

    fn record(&self) -> Option<&UpdateMsg> {
        self.exposed.as_ref().and_then(|(_, cursor)| cursor.record())
    }

    fn close(&mut self) {
        self.close_all();
    }
}
