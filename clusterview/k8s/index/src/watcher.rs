//! Per-caller watches.
//!
//! A cache notifies its `WatcherList` synchronously while it still holds its index. Each
//! `Watcher` translates those notifications into typed events on a bounded queue that the caller's
//! stream drains. Notifications never block: a watcher whose queue is full reports an overflow
//! error to its caller and removes itself from the list.

use crate::{subject_index::VisibleNames, NameSet};
use ahash::AHashMap as HashMap;
use clusterview_core::{Error, Event, EventStream, Status, UserInfo};
use parking_lot::Mutex;
use prometheus_client::metrics::counter::Counter;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{mpsc, watch};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Describes a change to the names visible to a set of subjects.
///
/// `index` reflects the state after the change.
pub struct MembershipChange<'a, I: ?Sized> {
    pub index: &'a I,
    pub names: &'a NameSet,
    pub users: &'a [String],
    pub groups: &'a [String],
}

/// Receives membership changes from a cache.
///
/// Implementations are invoked while the cache's index is held, so they must not block.
pub trait MembershipListener<I: ?Sized>: Send + Sync {
    fn group_membership_changed(&self, change: &MembershipChange<'_, I>);
}

/// The set of listeners registered with a cache.
pub struct WatcherList<I: ?Sized> {
    next_id: AtomicU64,
    watchers: Mutex<BTreeMap<u64, Arc<dyn MembershipListener<I>>>>,
}

/// Identifies a listener in a `WatcherList` without keeping the list alive.
#[derive(Clone)]
pub struct Registration {
    id: u64,
    list: Weak<dyn Deregister>,
}

trait Deregister: Send + Sync {
    fn deregister(&self, id: u64);
}

/// Produces the objects a watcher emits.
pub(crate) trait WatchSource: Send + Sync + 'static {
    type Index: VisibleNames + Send + Sync + 'static;
    type Object: Clone + Send + 'static;

    /// Returns the current object for a name the user may see.
    fn fetch(
        &self,
        index: &Self::Index,
        user: &UserInfo,
        name: &str,
    ) -> Result<Option<Self::Object>, Error>;

    /// Builds the object reported when a name leaves the user's view.
    fn placeholder(&self, name: &str) -> Self::Object;

    fn resource_version(obj: &Self::Object) -> String;
}

struct Watcher<S: WatchSource> {
    user: UserInfo,
    source: Arc<S>,

    /// The version of each name last delivered to the caller.
    known: Mutex<HashMap<String, String>>,

    events: mpsc::Sender<Event<S::Object>>,

    /// Holds at most one terminal error.
    errors: mpsc::Sender<Status>,

    closed: AtomicBool,
    registration: Registration,
    overflows: Counter,
}

/// A caller's watch on a view.
pub struct Watch<T> {
    initial: Vec<T>,
    events: mpsc::Receiver<Event<T>>,
    errors: mpsc::Receiver<Status>,
    stop: StopHandle,
}

/// Stops a watch. Cloneable and idempotent.
#[derive(Clone)]
pub struct StopHandle(Arc<StopState>);

struct StopState {
    tx: watch::Sender<bool>,
    registration: Registration,
}

// === impl MembershipChange ===

impl<I: ?Sized> MembershipChange<'_, I> {
    /// Returns true if the change names the user or any of its groups.
    pub fn affects(&self, user: &UserInfo) -> bool {
        self.users.iter().any(|u| *u == user.name)
            || self.groups.iter().any(|g| user.groups.contains(g))
    }
}

// === impl WatcherList ===

impl<I: ?Sized> Default for WatcherList<I> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            watchers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<I: ?Sized + 'static> WatcherList<I> {
    pub(crate) fn len(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Delivers a change to every registered listener, returning the number notified.
    ///
    /// Listeners may deregister themselves while being notified.
    pub fn notify(&self, change: &MembershipChange<'_, I>) -> usize {
        let watchers = self.watchers.lock().values().cloned().collect::<Vec<_>>();
        for w in &watchers {
            w.group_membership_changed(change);
        }
        watchers.len()
    }

    /// Reserves a registration for a listener that is inserted later.
    pub fn reserve(self: &Arc<Self>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let list = Arc::downgrade(self) as Weak<dyn Deregister>;
        Registration { id, list }
    }

    pub fn insert(&self, registration: &Registration, listener: Arc<dyn MembershipListener<I>>) {
        self.watchers.lock().insert(registration.id, listener);
    }
}

impl<I: ?Sized + 'static> Deregister for WatcherList<I> {
    fn deregister(&self, id: u64) {
        if self.watchers.lock().remove(&id).is_some() {
            tracing::trace!(id, "watcher removed");
        }
    }
}

// === impl Registration ===

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn deregister(&self) {
        if let Some(list) = self.list.upgrade() {
            list.deregister(self.id);
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

// === impl Watcher ===

/// Builds a watch from a consistent read of `index` and registers it with `watchers`.
///
/// The caller must hold `index` for the duration of the call so that no change is delivered
/// between the initial read and registration.
pub(crate) fn start<S: WatchSource>(
    watchers: &Arc<WatcherList<S::Index>>,
    source: Arc<S>,
    index: &S::Index,
    user: UserInfo,
    include_initial: bool,
    capacity: usize,
    overflows: Counter,
) -> Result<Watch<S::Object>, Error> {
    let mut initial = Vec::new();
    let mut known = HashMap::new();
    for name in index.visible_names(&user) {
        if let Some(obj) = source.fetch(index, &user, &name)? {
            known.insert(name, S::resource_version(&obj));
            if include_initial {
                initial.push(obj);
            }
        }
    }

    let (events_tx, events) = mpsc::channel(capacity.max(1));
    let (errors_tx, errors) = mpsc::channel(1);
    let registration = watchers.reserve();
    tracing::debug!(
        id = registration.id(),
        user = %user.name,
        known = known.len(),
        "watch started"
    );

    let watcher = Arc::new(Watcher {
        user,
        source,
        known: Mutex::new(known),
        events: events_tx,
        errors: errors_tx,
        closed: AtomicBool::new(false),
        registration: registration.clone(),
        overflows,
    });
    watchers.insert(&registration, watcher);

    let (tx, _) = watch::channel(false);
    Ok(Watch {
        initial,
        events,
        errors,
        stop: StopHandle(Arc::new(StopState { tx, registration })),
    })
}

impl<S: WatchSource> Watcher<S> {
    /// Enqueues an event, closing the watcher when the queue is full or the caller is gone.
    fn push(&self, event: Event<S::Object>) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::info!(
                    id = self.registration.id(),
                    user = %self.user.name,
                    "watch queue overflowed; dropping watcher"
                );
                self.overflows.inc();
                self.fail(Status::new("watch queue overflowed"));
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(id = self.registration.id(), "watch receiver dropped");
                self.close();
                false
            }
        }
    }

    fn fail(&self, status: Status) {
        // Only the first error is delivered.
        let _ = self.errors.try_send(status);
        self.close();
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.registration.deregister();
        }
    }
}

impl<S: WatchSource> MembershipListener<S::Index> for Watcher<S> {
    fn group_membership_changed(&self, change: &MembershipChange<'_, S::Index>) {
        if self.closed.load(Ordering::Acquire) || !change.affects(&self.user) {
            return;
        }

        // A change to one subject must not hide names granted through the user's other subjects,
        // so the visible set is recomputed from the updated index.
        let visible = change.index.visible_names(&self.user);
        let mut known = self.known.lock();

        let removed = known
            .keys()
            .filter(|name| !visible.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        for name in removed {
            known.remove(&name);
            if !self.push(Event::Deleted(self.source.placeholder(&name))) {
                return;
            }
        }

        for name in &visible {
            let obj = match self.source.fetch(change.index, &self.user, name) {
                Ok(Some(obj)) => obj,
                Ok(None) => {
                    if known.remove(name).is_some()
                        && !self.push(Event::Deleted(self.source.placeholder(name)))
                    {
                        return;
                    }
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%error, %name, "failed to fetch watched resource");
                    self.fail(Status::new(error));
                    return;
                }
            };

            let version = S::resource_version(&obj);
            let event = match known.get_mut(name) {
                None => {
                    known.insert(name.clone(), version);
                    Event::Added(obj)
                }
                Some(v) if *v != version => {
                    *v = version;
                    Event::Modified(obj)
                }
                Some(_) => continue,
            };
            if !self.push(event) {
                return;
            }
        }
    }
}

// === impl Watch ===

impl<T: Send + 'static> Watch<T> {
    /// The objects visible when the watch started, if requested.
    pub fn initial(&self) -> &[T] {
        &self.initial
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Streams the initial objects as `Added` events followed by changes.
    ///
    /// The stream ends when the watch is stopped, after an `Error` event, or when the cache is
    /// dropped. Dropping the stream stops the watch.
    pub fn results(self) -> EventStream<T> {
        let Self {
            initial,
            mut events,
            mut errors,
            stop,
        } = self;
        let mut stopped = stop.0.tx.subscribe();

        Box::pin(async_stream::stream! {
            for obj in initial {
                if stop.is_stopped() {
                    return;
                }
                yield Event::Added(obj);
            }

            loop {
                if stop.is_stopped() {
                    return;
                }

                // A terminal error is delivered ahead of any events still queued.
                tokio::select! {
                    biased;

                    _ = stopped.changed() => {}

                    status = errors.recv() => {
                        if let Some(status) = status {
                            yield Event::Error(status);
                        }
                        return;
                    }

                    event = events.recv() => match event {
                        Some(event) => yield event,
                        None => return,
                    },
                }
            }
        })
    }
}

// === impl StopHandle ===

impl StopHandle {
    pub fn stop(&self) {
        self.0.tx.send_replace(true);
        self.0.registration.deregister();
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.tx.borrow()
    }
}

impl Drop for StopState {
    fn drop(&mut self) {
        self.registration.deregister();
    }
}
