use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Events routed through a [`Subject`] carry a topic name
pub trait Topic {
    fn topic(&self) -> &'static str;
}

/// Handle returned by [`Subject::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Rc<dyn Fn(&E)>;

struct Subscription<E> {
    id: ListenerId,
    /// `None` listens to every topic
    topic: Option<&'static str>,
    once: bool,
    listener: Listener<E>,
}

/// Single-threaded publish/subscribe subject.
///
/// Ports, sockets, components and networks each own one of these instead of
/// inheriting emitter behavior.
pub struct Subject<E> {
    subscriptions: RefCell<Vec<Subscription<E>>>,
    next_id: Cell<u64>,
}

impl<E: Topic> Subject<E> {
    pub fn new() -> Self {
        Self {
            subscriptions: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    fn register(&self, topic: Option<&'static str>, once: bool, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.subscriptions.borrow_mut().push(Subscription {
            id,
            topic,
            once,
            listener,
        });
        id
    }

    /// Subscribe a listener to one topic
    pub fn subscribe(&self, topic: &'static str, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.register(Some(topic), false, Rc::new(listener))
    }

    /// Subscribe a listener that is dropped after its first delivery
    pub fn subscribe_once(&self, topic: &'static str, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.register(Some(topic), true, Rc::new(listener))
    }

    /// Subscribe a listener to every topic
    pub fn subscribe_all(&self, listener: impl Fn(&E) + 'static) -> ListenerId {
        self.register(None, false, Rc::new(listener))
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Number of listeners that would receive an event on `topic`
    pub fn listener_count(&self, topic: &str) -> usize {
        self.subscriptions
            .borrow()
            .iter()
            .filter(|s| s.topic.map_or(true, |t| t == topic))
            .count()
    }

    pub fn clear(&self) {
        self.subscriptions.borrow_mut().clear();
    }

    /// Deliver an event to every matching listener in subscription order
    pub fn emit(&self, event: &E) {
        let topic = event.topic();
        // Snapshot so listeners can subscribe or unsubscribe while we deliver
        let listeners: Vec<Listener<E>> = {
            let mut subscriptions = self.subscriptions.borrow_mut();
            let matching = subscriptions
                .iter()
                .filter(|s| s.topic.map_or(true, |t| t == topic))
                .map(|s| s.listener.clone())
                .collect();
            subscriptions.retain(|s| !(s.once && s.topic == Some(topic)));
            matching
        };
        for listener in listeners {
            listener(event);
        }
    }
}

impl<E: Topic> Default for Subject<E> {
    fn default() -> Self {
        Self::new()
    }
}
