//! Error handler registry

use crate::error::WorkError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Decides whether an error is of interest
pub type ErrorMatcher = Arc<dyn Fn(&WorkError) -> bool + Send + Sync>;

/// Invoked on the loop thread for every matching error
pub(crate) type HandlerFn = Arc<Mutex<Box<dyn FnMut(&WorkError) + Send>>>;

/// Identifies a registered handler
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Matcher accepting errors of type `E`
pub fn matches<E>() -> ErrorMatcher
where
    E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    Arc::new(|err: &WorkError| err.is::<E>())
}

struct Entry {
    id: HandlerId,
    matchers: Vec<ErrorMatcher>,
    handler: HandlerFn,
}

#[derive(Default)]
pub(crate) struct ErrorHandlers {
    entries: Vec<Entry>,
    next_id: u64,
}

impl ErrorHandlers {
    pub(crate) fn add(&mut self, matchers: Vec<ErrorMatcher>, handler: HandlerFn) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        self.entries.push(Entry {
            id,
            matchers,
            handler,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Handlers with at least one matcher accepting `err`, in registration order
    pub(crate) fn matching(&self, err: &WorkError) -> Vec<HandlerFn> {
        self.entries
            .iter()
            .filter(|entry| entry.matchers.iter().any(|matcher| matcher(err)))
            .map(|entry| entry.handler.clone())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
