use futures::prelude::*;
use std::pin::Pin;

/// A typed change to a caller's view of a resource kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event<T> {
    Added(T),
    Modified(T),
    Deleted(T),

    /// Terminates a watch. The caller must start a new watch to keep observing changes.
    Error(Status),
}

/// Describes why a watch was terminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub message: String,
}

pub type EventStream<T> = Pin<Box<dyn Stream<Item = Event<T>> + Send + 'static>>;

// === impl Event ===

impl<T> Event<T> {
    /// The wire name of the event's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
            Self::Error(_) => "ERROR",
        }
    }

    pub fn object(&self) -> Option<&T> {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => Some(obj),
            Self::Error(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        match self {
            Self::Added(obj) => Event::Added(f(obj)),
            Self::Modified(obj) => Event::Modified(f(obj)),
            Self::Deleted(obj) => Event::Deleted(f(obj)),
            Self::Error(status) => Event::Error(status),
        }
    }
}

// === impl Status ===

impl Status {
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}
