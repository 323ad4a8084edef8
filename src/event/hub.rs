//! Listener registry and fan-out.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;

/// Capacity of the broadcast side of a hub.
pub const DEFAULT_CAPACITY: usize = 256;

/// Events that can be routed by kind.
pub trait HubEvent: Clone + Send + 'static {
    /// Discriminant listeners register against.
    type Kind: Copy + Eq + Debug + Send + Sync + 'static;

    /// Returns the kind of this event.
    fn kind(&self) -> Self::Kind;
}

/// A synchronous listener.
///
/// Identity is the `Arc` allocation: registering the same `Arc` twice is
/// a no-op, and cloning the `Arc` keeps the identity.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// What a listener is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic<K> {
    /// Every event.
    All,
    /// Events of one kind.
    Kind(K),
}

impl<K: PartialEq> Topic<K> {
    fn matches(&self, kind: &K) -> bool {
        match self {
            Self::All => true,
            Self::Kind(k) => k == kind,
        }
    }
}

struct Registration<E: HubEvent> {
    topic: Topic<E::Kind>,
    listener: Listener<E>,
    once: bool,
}

fn listener_ptr<E: 'static>(listener: &Listener<E>) -> *const () {
    Arc::as_ptr(listener).cast::<()>()
}

struct EventHubInner<E: HubEvent> {
    registrations: Mutex<Vec<Registration<E>>>,
    sender: broadcast::Sender<E>,
}

/// Typed pub/sub with synchronous listeners and async subscriptions.
///
/// Listeners run on the emitting thread, in registration order, before
/// `emit` returns. The same event is then broadcast to every
/// [`Subscription`]. Cloning a hub shares its listeners.
pub struct EventHub<E: HubEvent> {
    inner: Arc<EventHubInner<E>>,
}

impl<E: HubEvent> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: HubEvent> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E: HubEvent> EventHub<E> {
    /// Creates a hub whose subscriptions buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventHubInner {
                registrations: Mutex::new(Vec::new()),
                sender,
            }),
        }
    }

    fn registrations(&self) -> MutexGuard<'_, Vec<Registration<E>>> {
        self.inner
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, topic: Topic<E::Kind>, listener: Listener<E>, once: bool) -> bool {
        let mut regs = self.registrations();
        let ptr = listener_ptr(&listener);
        if regs
            .iter()
            .any(|r| r.topic == topic && listener_ptr(&r.listener) == ptr)
        {
            return false;
        }
        regs.push(Registration {
            topic,
            listener,
            once,
        });
        true
    }

    /// Registers a persistent listener.
    ///
    /// Returns false if this listener was already registered for `topic`.
    pub fn on(&self, topic: Topic<E::Kind>, listener: Listener<E>) -> bool {
        self.register(topic, listener, false)
    }

    /// Registers a listener that is removed after its first call.
    pub fn once(&self, topic: Topic<E::Kind>, listener: Listener<E>) -> bool {
        self.register(topic, listener, true)
    }

    /// Removes a listener. Returns false if it was not registered for `topic`.
    pub fn off(&self, topic: Topic<E::Kind>, listener: &Listener<E>) -> bool {
        let mut regs = self.registrations();
        let ptr = listener_ptr(listener);
        let before = regs.len();
        regs.retain(|r| !(r.topic == topic && listener_ptr(&r.listener) == ptr));
        regs.len() != before
    }

    /// Removes every listener.
    pub fn clear(&self) {
        self.registrations().clear();
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registrations().len()
    }

    /// Delivers an event.
    ///
    /// A listener registered under several matching topics is called once.
    /// The registration lock is not held while listeners run, so a listener
    /// may register, remove or emit.
    pub fn emit(&self, event: E) {
        let kind = event.kind();
        let listeners: Vec<Listener<E>> = {
            let mut regs = self.registrations();
            let mut matched: Vec<Listener<E>> = Vec::new();
            regs.retain(|r| {
                if !r.topic.matches(&kind) {
                    return true;
                }
                let ptr = listener_ptr(&r.listener);
                if !matched.iter().any(|l| listener_ptr(l) == ptr) {
                    matched.push(Arc::clone(&r.listener));
                }
                !r.once
            });
            matched
        };

        for listener in &listeners {
            listener(&event);
        }

        // No receivers is fine.
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            receiver: self.inner.sender.subscribe(),
        }
    }

    /// Waits for an event matching `filter`.
    ///
    /// Returns `None` if the timeout expires or the hub is dropped.
    pub async fn wait_for<F>(&self, filter: F, timeout: Duration) -> Option<E>
    where
        F: Fn(&E) -> bool,
    {
        let mut subscription = self.subscribe();

        tokio::select! {
            biased;
            result = async {
                loop {
                    if let Some(event) = subscription.recv().await {
                        if filter(&event) {
                            return Some(event);
                        }
                    } else {
                        return None;
                    }
                }
            } => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

/// A subscription to events.
pub struct Subscription<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Receives the next event.
    ///
    /// Events missed because the subscriber fell behind are skipped.
    /// Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("subscription lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
