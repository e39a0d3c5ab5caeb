//! Event-Layer Contract
//!
//! The stream primitives built on top of the core are external
//! collaborators; this module defines only the interface they consume.
//!
//! An [`EventObserver`] is the three-callback record `{next, error, wait}`
//! the upper layer pushes events into. Emitters hand observers events and
//! use the scheduler queues purely as a scheduling substrate
//! ([`Queue::enqueue`](crate::graph::Queue::enqueue)); ownership across
//! async resumptions travels with
//! [`Owner::capture`](crate::reactive::Owner::capture).

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

/// One delivery to an observer.
pub enum Event<T> {
    /// A value arrived.
    Next(T),
    /// The stream failed; the payload is shared by every observer.
    Error(Rc<dyn Error + 'static>),
    /// The stream entered a waiting state.
    Wait,
}

impl<T: fmt::Debug> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Next(value) => f.debug_tuple("Next").field(value).finish(),
            Event::Error(payload) => f.debug_tuple("Error").field(&payload.to_string()).finish(),
            Event::Wait => f.write_str("Wait"),
        }
    }
}

type NextFn<T> = Box<dyn FnMut(T)>;
type ErrorFn = Box<dyn FnMut(Rc<dyn Error + 'static>)>;
type WaitFn = Box<dyn FnMut()>;

/// The `{next, error, wait}` callback record consumed by the event layer.
///
/// Unset callbacks drop their events.
pub struct EventObserver<T> {
    next: Option<NextFn<T>>,
    error: Option<ErrorFn>,
    wait: Option<WaitFn>,
}

impl<T> Default for EventObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventObserver<T> {
    /// An observer that ignores everything.
    pub fn new() -> Self {
        Self {
            next: None,
            error: None,
            wait: None,
        }
    }

    /// Observer reacting to values only.
    pub fn on_next(f: impl FnMut(T) + 'static) -> Self {
        Self::new().with_next(f)
    }

    pub fn with_next(mut self, f: impl FnMut(T) + 'static) -> Self {
        self.next = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl FnMut(Rc<dyn Error + 'static>) + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn with_wait(mut self, f: impl FnMut() + 'static) -> Self {
        self.wait = Some(Box::new(f));
        self
    }

    /// Deliver one event.
    pub fn handle(&mut self, event: Event<T>) {
        match event {
            Event::Next(value) => {
                if let Some(next) = &mut self.next {
                    next(value);
                }
            }
            Event::Error(payload) => {
                if let Some(error) = &mut self.error {
                    error(payload);
                }
            }
            Event::Wait => {
                if let Some(wait) = &mut self.wait {
                    wait();
                }
            }
        }
    }

    /// Adapt this observer to another input type.
    ///
    /// The combinator form the upper layer builds its operators from:
    /// values map through `f`, error and wait pass through untouched.
    pub fn adapt<U>(self, mut f: impl FnMut(U) -> T + 'static) -> EventObserver<U>
    where
        T: 'static,
        U: 'static,
    {
        let inner = Rc::new(RefCell::new(self));
        let on_next = inner.clone();
        let on_error = inner.clone();
        let on_wait = inner;
        EventObserver::new()
            .with_next(move |value| on_next.borrow_mut().handle(Event::Next(f(value))))
            .with_error(move |payload| on_error.borrow_mut().handle(Event::Error(payload)))
            .with_wait(move || on_wait.borrow_mut().handle(Event::Wait))
    }
}

impl<T> fmt::Debug for EventObserver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventObserver")
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("wait", &self.wait.is_some())
            .finish()
    }
}

/// Anything the upper layer can push events into.
pub trait Handler<T> {
    fn handle(&mut self, event: Event<T>);
}

impl<T> Handler<T> for EventObserver<T> {
    fn handle(&mut self, event: Event<T>) {
        EventObserver::handle(self, event)
    }
}

/// Anything observers can be attached to.
pub trait Emitter<T> {
    /// Attach an observer; the emitter delivers subsequent events to it.
    fn subscribe(&mut self, observer: EventObserver<T>);
}
