//! Keyset-paginated message cursor

use std::collections::VecDeque;

use super::MailStore;
use crate::error::StoreError;
use crate::models::{LocalMessageId, Message};
use crate::search::CompiledQuery;

const DEFAULT_PAGE_SIZE: usize = 100;

/// Lazy, finite, restartable iterator over the messages matching a query
///
/// Rows are read a page at a time in ascending local id order, keyed on the
/// last id returned, so rows inserted behind the cursor are never repeated.
/// An error is yielded once and ends the iteration.
pub struct MessageCursor<'a> {
    store: &'a dyn MailStore,
    query: CompiledQuery,
    page_size: usize,
    last_id: Option<LocalMessageId>,
    buffer: VecDeque<Message>,
    exhausted: bool,
}

impl<'a> MessageCursor<'a> {
    pub fn new(store: &'a dyn MailStore, query: CompiledQuery) -> Self {
        Self {
            store,
            query,
            page_size: DEFAULT_PAGE_SIZE,
            last_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start over from the first matching row
    pub fn rewind(&mut self) {
        self.last_id = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let page = self
            .store
            .query_page(&self.query, self.last_id, self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_id = Some(last.id);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for MessageCursor<'_> {
    type Item = Result<Message, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
