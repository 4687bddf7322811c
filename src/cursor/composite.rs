//! K-way merge of tagged update cursors.

use super::DbCursor;
use crate::error::ChangelogError;
use crate::replication::UpdateMsg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Ready,
    Closed,
}

/// Merges several cursors, each identified by a tag, into one stream
/// ordered by CSN.
///
/// `next()` only advances the source whose record was returned last.
/// Sources added in the meantime are advanced once and join the merge,
/// and exhausted sources are polled again in case they received new
/// records.
pub struct CompositeDbCursor<C, T> {
    /// Sources with a current record, sorted by (CSN, tag).
    ready: Vec<(C, T)>,
    exhausted: Vec<(C, T)>,
    added: Vec<(C, T)>,
    /// Whether `ready[0]`'s record has been returned by `next()`.
    front_returned: bool,
    state: State,
}

impl<C, T> Default for CompositeDbCursor<C, T> {
    fn default() -> Self {
        Self {
            ready: Vec::new(),
            exhausted: Vec::new(),
            added: Vec::new(),
            front_returned: false,
            state: State::Uninitialized,
        }
    }
}

impl<C, T> CompositeDbCursor<C, T>
where
    C: DbCursor<Item = UpdateMsg>,
    T: Ord + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source. It takes part in the merge from the next `next()`.
    pub fn add_cursor(&mut self, cursor: C, tag: T) {
        if self.state == State::Closed {
            let mut cursor = cursor;
            cursor.close();
            return;
        }
        self.added.push((cursor, tag));
    }

    /// Removes and closes the source tagged `tag`.
    pub fn remove_cursor(&mut self, tag: &T) -> bool {
        let mut removed = false;
        if let Some(index) = self.ready.iter().position(|(_, t)| t == tag) {
            let (mut cursor, _) = self.ready.remove(index);
            cursor.close();
            if index == 0 {
                self.front_returned = false;
            }
            removed = true;
        }
        for pool in [&mut self.exhausted, &mut self.added] {
            if let Some(index) = pool.iter().position(|(_, t)| t == tag) {
                let (mut cursor, _) = pool.remove(index);
                cursor.close();
                removed = true;
            }
        }
        removed
    }

    pub fn contains(&self, tag: &T) -> bool {
        self.ready
            .iter()
            .chain(&self.exhausted)
            .chain(&self.added)
            .any(|(_, t)| t == tag)
    }

    /// Tags of every source.
    pub fn tags(&self) -> impl Iterator<Item = &T> {
        self.ready
            .iter()
            .chain(&self.exhausted)
            .chain(&self.added)
            .map(|(_, t)| t)
    }

    /// Tag of the source the current record comes from.
    pub fn data(&self) -> Option<&T> {
        if !self.front_returned {
            return None;
        }
        self.ready.first().map(|(_, tag)| tag)
    }

    /// The source the current record comes from.
    pub fn current_cursor(&self) -> Option<&C> {
        if !self.front_returned {
            return None;
        }
        self.ready.first().map(|(cursor, _)| cursor)
    }

    fn place(&mut self, mut cursor: C, tag: T) -> Result<(), ChangelogError> {
        if cursor.next()? {
            self.ready.push((cursor, tag));
        } else {
            self.exhausted.push((cursor, tag));
        }
        Ok(())
    }

    fn sort_key(entry: &(C, T)) -> (Option<crate::replication::Csn>, T) {
        (entry.0.record().map(UpdateMsg::csn), entry.1.clone())
    }
}

impl<C, T> DbCursor for CompositeDbCursor<C, T>
where
    C: DbCursor<Item = UpdateMsg>,
    T: Ord + Clone,
{
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        if !self.front_returned {
            return None;
        }
        self.ready.first().and_then(|(cursor, _)| cursor.record())
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        if self.state == State::Closed {
            return Ok(false);
        }
        self.state = State::Ready;

        for (cursor, tag) in std::mem::take(&mut self.exhausted) {
            self.place(cursor, tag)?;
        }
        if self.front_returned && !self.ready.is_empty() {
            let (cursor, tag) = self.ready.remove(0);
            self.place(cursor, tag)?;
        }
        for (cursor, tag) in std::mem::take(&mut self.added) {
            self.place(cursor, tag)?;
        }

        self.ready.sort_by_cached_key(Self::sort_key);
        self.front_returned = !self.ready.is_empty();
        Ok(self.front_returned)
    }

    fn refresh(&mut self) -> Result<(), ChangelogError> {
        if self.state != State::Ready || !self.front_returned {
            return Ok(());
        }
        let mut stale = Vec::new();
        for (mut cursor, tag) in std::mem::take(&mut self.ready) {
            cursor.refresh()?;
            if cursor.record().is_some() {
                self.ready.push((cursor, tag));
            } else {
                stale.push((cursor, tag));
            }
        }
        stale.append(&mut self.exhausted);
        stale.append(&mut self.added);
        for (cursor, tag) in stale {
            self.place(cursor, tag)?;
        }

        self.ready.sort_by_cached_key(Self::sort_key);
        self.front_returned = !self.ready.is_empty();
        Ok(())
    }

    fn close(&mut self) {
        for (mut cursor, _) in self
            .ready
            .drain(..)
            .chain(self.exhausted.drain(..))
            .chain(self.added.drain(..))
        {
            cursor.close();
        }
        self.front_returned = false;
        self.state = State::Closed;
    }
}

impl<C, T: std::fmt::Debug> std::fmt::Debug for CompositeDbCursor<C, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeDbCursor")
            .field("state", &self.state)
            .field("ready", &self.ready.iter().map(|(_, t)| t).collect::<Vec<_>>())
            .field("exhausted", &self.exhausted.iter().map(|(_, t)| t).collect::<Vec<_>>())
            .field("added", &self.added.iter().map(|(_, t)| t).collect::<Vec<_>>())
            .finish()
    }
}
