//! Single-threaded cooperative multiplexer over I/O readiness, timers
//! and cross-thread signals.
//!
//! Listeners are identified by keys; each callback returns `true` to
//! remove itself. Callbacks must not block — anything that needs to wait
//! schedules a timer or stores a continuation. Registration and mask
//! changes requested from inside a callback are collected and applied
//! when the callback returns, which is what makes
//! [`Api::set_io_mask`] safe to call mid-dispatch.

use hashbrown::HashMap;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub type ListenerKey = u64;

/// Payload delivered with a cross-thread signal.
pub type SignalPayload = Box<dyn Any + Send>;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Event-type mask for I/O listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask(u8);

impl Mask {
    pub const NONE: Mask = Mask(0);
    pub const READ: Mask = Mask(1);
    pub const WRITE: Mask = Mask(2);
    pub const READ_WRITE: Mask = Mask(3);

    pub fn readable(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & 2 != 0
    }

    fn interest(self) -> Option<Interest> {
        match (self.readable(), self.writable()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

/// What a callback is being invoked for.
pub enum Event {
    Io(Mask),
    Timer,
    Signal(SignalPayload),
}

type Callback<A> = Box<dyn FnMut(&mut A, &mut Api<A>, Event) -> bool>;

enum Kind {
    Io { fd: RawFd, mask: Mask },
    Timer { interval: Duration, next_deadline: Instant },
    Signal,
}

struct Listener<A> {
    kind: Kind,
    // Taken out of the slot while the callback runs.
    callback: Option<Callback<A>>,
}

enum Op<A> {
    AddIo {
        key: ListenerKey,
        fd: RawFd,
        mask: Mask,
        callback: Callback<A>,
    },
    AddTimer {
        key: ListenerKey,
        deadline: Instant,
        interval: Duration,
        callback: Callback<A>,
    },
    AddSignal {
        key: ListenerKey,
        callback: Callback<A>,
    },
    SetIoMask {
        key: ListenerKey,
        mask: Mask,
    },
    Remove {
        key: ListenerKey,
    },
}

/// Cloneable handle used by other threads to push a signal into the
/// dispatcher; the registered signal listener runs in the dispatcher's
/// thread with the payload. This is the only sanctioned cross-thread
/// path into the event loop.
#[derive(Clone)]
pub struct SignalSender {
    queue: Arc<Mutex<VecDeque<(ListenerKey, SignalPayload)>>>,
    waker: Arc<Waker>,
}

impl SignalSender {
    pub fn signal(&self, key: ListenerKey, payload: SignalPayload) {
        self.queue.lock().unwrap().push_back((key, payload));
        let _ = self.waker.wake();
    }
}

/// Cloneable handle that stops the dispatcher loop from any thread.
#[derive(Clone)]
pub struct Stopper {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Stopper {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// Registration surface handed to callbacks. Operations are applied
/// after the current callback returns.
pub struct Api<'d, A> {
    ops: &'d mut Vec<Op<A>>,
    next_key: &'d mut ListenerKey,
    sender: &'d SignalSender,
    stopper: &'d Stopper,
}

impl<'d, A> Api<'d, A> {
    fn allocate_key(&mut self) -> ListenerKey {
        let key = *self.next_key;
        *self.next_key += 1;
        key
    }

    pub fn add_io_listener<F>(&mut self, fd: RawFd, mask: Mask, callback: F) -> ListenerKey
    where
        F: FnMut(&mut A, &mut Api<A>, Event) -> bool + 'static,
    {
        let key = self.allocate_key();
        self.ops.push(Op::AddIo {
            key,
            fd,
            mask,
            callback: Box::new(callback),
        });
        key
    }

    /// Adds a timer firing `first` from now and every `interval` after
    /// that; a zero interval makes it one-shot.
    pub fn add_timer<F>(&mut self, first: Duration, interval: Duration, callback: F) -> ListenerKey
    where
        F: FnMut(&mut A, &mut Api<A>, Event) -> bool + 'static,
    {
        let key = self.allocate_key();
        self.ops.push(Op::AddTimer {
            key,
            deadline: Instant::now() + first,
            interval,
            callback: Box::new(callback),
        });
        key
    }

    pub fn add_signal_listener<F>(&mut self, callback: F) -> ListenerKey
    where
        F: FnMut(&mut A, &mut Api<A>, Event) -> bool + 'static,
    {
        let key = self.allocate_key();
        self.ops.push(Op::AddSignal {
            key,
            callback: Box::new(callback),
        });
        key
    }

    /// Changes an I/O listener's event mask. Safe from inside any
    /// callback: the change is applied once the callback returns, so it
    /// cannot race with the event currently being dispatched.
    pub fn set_io_mask(&mut self, key: ListenerKey, mask: Mask) {
        self.ops.push(Op::SetIoMask { key, mask });
    }

    pub fn remove_listener(&mut self, key: ListenerKey) {
        self.ops.push(Op::Remove { key });
    }

    pub fn signal_sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }
}

/// The event dispatcher. `A` is the application the callbacks operate
/// on; it is borrowed for the duration of each `run`/`run_once` call so
/// callbacks get full mutable access without sharing.
pub struct Dispatcher<A> {
    poll: Poll,
    events: Events,
    listeners: HashMap<ListenerKey, Listener<A>>,
    timer_heap: BinaryHeap<Reverse<(Instant, ListenerKey)>>,
    next_key: ListenerKey,
    sender: SignalSender,
    stopper: Stopper,
    ready: Vec<(ListenerKey, Mask)>,
}

impl<A> Dispatcher<A> {
    pub fn new() -> io::Result<Dispatcher<A>> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let sender = SignalSender {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            waker: waker.clone(),
        };
        let stopper = Stopper {
            flag: Arc::new(AtomicBool::new(false)),
            waker,
        };
        Ok(Dispatcher {
            poll,
            events: Events::with_capacity(1024),
            listeners: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            next_key: 1,
            sender,
            stopper,
            ready: Vec::new(),
        })
    }

    /// Arranges for `SIGINT`/`SIGTERM` to stop the loop.
    pub fn watch_process_signals(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, self.stopper.flag.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, self.stopper.flag.clone())?;
        Ok(())
    }

    pub fn signal_sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn stopper(&self) -> Stopper {
        self.stopper.clone()
    }

    pub fn stopped(&self) -> bool {
        self.stopper.flag.load(Ordering::SeqCst)
    }

    fn allocate_key(&mut self) -> ListenerKey {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    pub fn add_io_listener<F>(&mut self, fd: RawFd, mask: Mask, callback: F) -> ListenerKey
    where
        F: FnMut(&mut A, &mut Api<A>, Event) -> bool + 'static,
    {
        let key = self.allocate_key();
        self.apply(Op::AddIo {
            key,
            fd,
            mask,
            callback: Box::new(callback),
        });
        key
    }

    pub fn add_timer<F>(&mut self, first: Duration, interval: Duration, callback: F) -> ListenerKey
    where
        F: FnMut(&mut A, &mut Api<A>, Event) -> bool + 'static,
    {
        let key = self.allocate_key();
        self.apply(Op::AddTimer {
            key,
            deadline: Instant::now() + first,
            interval,
            callback: Box::new(callback),
        });
        key
    }

    pub fn add_signal_listener<F>(&mut self, callback: F) -> ListenerKey
    where
        F: FnMut(&mut A, &mut Api<A>, Event) -> bool + 'static,
    {
        let key = self.allocate_key();
        self.apply(Op::AddSignal {
            key,
            callback: Box::new(callback),
        });
        key
    }

    pub fn set_io_mask(&mut self, key: ListenerKey, mask: Mask) {
        self.apply(Op::SetIoMask { key, mask });
    }

    pub fn remove_listener(&mut self, key: ListenerKey) {
        self.apply(Op::Remove { key });
    }

    fn apply(&mut self, op: Op<A>) {
        match op {
            Op::AddIo {
                key,
                fd,
                mask,
                callback,
            } => {
                if let Some(interest) = mask.interest() {
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(key as usize), interest)
                        .expect("I/O listener registration failed");
                }
                self.listeners.insert(
                    key,
                    Listener {
                        kind: Kind::Io { fd, mask },
                        callback: Some(callback),
                    },
                );
            }
            Op::AddTimer {
                key,
                deadline,
                interval,
                callback,
            } => {
                self.listeners.insert(
                    key,
                    Listener {
                        kind: Kind::Timer {
                            interval,
                            next_deadline: deadline,
                        },
                        callback: Some(callback),
                    },
                );
                self.timer_heap.push(Reverse((deadline, key)));
            }
            Op::AddSignal { key, callback } => {
                self.listeners.insert(
                    key,
                    Listener {
                        kind: Kind::Signal,
                        callback: Some(callback),
                    },
                );
            }
            Op::SetIoMask { key, mask } => {
                if let Some(listener) = self.listeners.get_mut(&key) {
                    if let Kind::Io {
                        fd,
                        mask: ref mut current,
                    } = listener.kind
                    {
                        let old = *current;
                        *current = mask;
                        let registry = self.poll.registry();
                        let token = Token(key as usize);
                        match (old.interest(), mask.interest()) {
                            (None, Some(interest)) => registry
                                .register(&mut SourceFd(&fd), token, interest)
                                .expect("I/O listener registration failed"),
                            (Some(_), Some(interest)) => registry
                                .reregister(&mut SourceFd(&fd), token, interest)
                                .expect("I/O listener reregistration failed"),
                            (Some(_), None) => {
                                let _ = registry.deregister(&mut SourceFd(&fd));
                            }
                            (None, None) => {}
                        }
                    }
                }
            }
            Op::Remove { key } => {
                if let Some(listener) = self.listeners.remove(&key) {
                    if let Kind::Io { fd, mask } = listener.kind {
                        if mask.interest().is_some() {
                            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
                        }
                    }
                }
            }
        }
    }

    fn invoke(&mut self, app: &mut A, key: ListenerKey, event: Event) {
        let mut callback = match self.listeners.get_mut(&key) {
            Some(listener) => match listener.callback.take() {
                Some(callback) => callback,
                // Re-entrant dispatch for a listener already running.
                None => return,
            },
            None => return,
        };

        let mut ops = Vec::new();
        let remove = {
            let mut api = Api {
                ops: &mut ops,
                next_key: &mut self.next_key,
                sender: &self.sender,
                stopper: &self.stopper,
            };
            callback(app, &mut api, event)
        };

        if remove {
            self.apply(Op::Remove { key });
        } else if let Some(listener) = self.listeners.get_mut(&key) {
            listener.callback = Some(callback);
        }

        for op in ops {
            self.apply(op);
        }
    }

    fn next_timeout(&mut self, max_wait: Option<Duration>) -> Option<Duration> {
        // Drop stale heap entries so they don't shorten the poll.
        let deadline = loop {
            match self.timer_heap.peek() {
                Some(&Reverse((deadline, key))) => match self.listeners.get(&key) {
                    Some(Listener {
                        kind: Kind::Timer { next_deadline, .. },
                        ..
                    }) if *next_deadline == deadline => break Some(deadline),
                    _ => {
                        self.timer_heap.pop();
                    }
                },
                None => break None,
            }
        };

        let until_timer =
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (until_timer, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    /// Runs the loop until stopped.
    pub fn run(&mut self, app: &mut A) {
        while !self.stopped() {
            self.run_once(app, None);
        }
    }

    /// Runs one poll-dispatch iteration, waiting at most `max_wait` (or
    /// until the next timer) for events.
    pub fn run_once(&mut self, app: &mut A, max_wait: Option<Duration>) {
        let timeout = self.next_timeout(max_wait);
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                panic!("Event poll failed: {}", err);
            }
        }

        self.ready.clear();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let mut mask = Mask::NONE;
            if event.is_readable() || event.is_read_closed() {
                mask = mask | Mask::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                mask = mask | Mask::WRITE;
            }
            self.ready.push((event.token().0 as ListenerKey, mask));
        }

        let ready = std::mem::take(&mut self.ready);
        for &(key, mask) in &ready {
            self.invoke(app, key, Event::Io(mask));
        }
        self.ready = ready;

        // Cross-thread signals queued since the last iteration.
        loop {
            let next = self.sender.queue.lock().unwrap().pop_front();
            match next {
                Some((key, payload)) => self.invoke(app, key, Event::Signal(payload)),
                None => break,
            }
        }

        // Expired timers.
        let now = Instant::now();
        loop {
            let (deadline, key) = match self.timer_heap.peek() {
                Some(&Reverse((deadline, key))) if deadline <= now => (deadline, key),
                _ => break,
            };
            self.timer_heap.pop();

            let live = matches!(
                self.listeners.get(&key),
                Some(Listener { kind: Kind::Timer { next_deadline, .. }, .. })
                    if *next_deadline == deadline
            );
            if !live {
                continue;
            }

            self.invoke(app, key, Event::Timer);

            let reschedule = match self.listeners.get_mut(&key) {
                Some(listener) => match listener.kind {
                    Kind::Timer {
                        interval,
                        ref mut next_deadline,
                    } => {
                        if interval.is_zero() {
                            None
                        } else {
                            *next_deadline = deadline + interval;
                            Some(*next_deadline)
                        }
                    }
                    _ => continue,
                },
                None => continue,
            };
            match reschedule {
                Some(next) => self.timer_heap.push(Reverse((next, key))),
                None => {
                    self.listeners.remove(&key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[derive(Default)]
    struct Counters {
        timer_fires: usize,
        io_fires: usize,
        signal_values: Vec<u32>,
    }

    #[test]
    fn test_one_shot_timer_fires_once() {
        let mut dispatcher: Dispatcher<Counters> = Dispatcher::new().unwrap();
        let mut app = Counters::default();

        dispatcher.add_timer(Duration::from_millis(1), Duration::ZERO, |app, _, _| {
            app.timer_fires += 1;
            false
        });

        for _ in 0..10 {
            dispatcher.run_once(&mut app, Some(Duration::from_millis(5)));
        }
        assert_eq!(app.timer_fires, 1);
    }

    #[test]
    fn test_repeating_timer_reschedules_until_removed() {
        let mut dispatcher: Dispatcher<Counters> = Dispatcher::new().unwrap();
        let mut app = Counters::default();

        dispatcher.add_timer(
            Duration::from_millis(1),
            Duration::from_millis(1),
            |app, _, _| {
                app.timer_fires += 1;
                app.timer_fires >= 3
            },
        );

        for _ in 0..50 {
            dispatcher.run_once(&mut app, Some(Duration::from_millis(5)));
            if app.timer_fires >= 3 {
                break;
            }
        }
        let after_removal = app.timer_fires;
        for _ in 0..5 {
            dispatcher.run_once(&mut app, Some(Duration::from_millis(2)));
        }

        assert_eq!(after_removal, 3);
        assert_eq!(app.timer_fires, 3);
    }

    #[test]
    fn test_signal_crosses_threads() {
        let mut dispatcher: Dispatcher<Counters> = Dispatcher::new().unwrap();
        let mut app = Counters::default();

        let key = dispatcher.add_signal_listener(|app: &mut Counters, _, event| {
            if let Event::Signal(payload) = event {
                app.signal_values.push(*payload.downcast::<u32>().unwrap());
            }
            false
        });

        let sender = dispatcher.signal_sender();
        let worker = std::thread::spawn(move || {
            sender.signal(key, Box::new(42u32));
            sender.signal(key, Box::new(43u32));
        });
        worker.join().unwrap();

        dispatcher.run_once(&mut app, Some(Duration::from_millis(50)));
        assert_eq!(app.signal_values, vec![42, 43]);
    }

    #[test]
    fn test_io_readiness_dispatches_listener() {
        use std::os::unix::io::AsRawFd;

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        let address = receiver.local_addr().unwrap();
        let sender_socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut dispatcher: Dispatcher<Counters> = Dispatcher::new().unwrap();
        let mut app = Counters::default();

        let fd = receiver.as_raw_fd();
        dispatcher.add_io_listener(fd, Mask::READ, move |app, _, event| {
            if let Event::Io(mask) = event {
                if mask.readable() {
                    let mut buffer = [0u8; 16];
                    while receiver.recv_from(&mut buffer).is_ok() {
                        app.io_fires += 1;
                    }
                }
            }
            false
        });

        sender_socket.send_to(&[1, 2, 3], address).unwrap();

        for _ in 0..100 {
            dispatcher.run_once(&mut app, Some(Duration::from_millis(10)));
            if app.io_fires > 0 {
                break;
            }
        }
        assert_eq!(app.io_fires, 1);
    }

    #[test]
    fn test_mask_change_from_callback_applies_after_return() {
        use std::os::unix::io::AsRawFd;

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_nonblocking(true).unwrap();
        let address = receiver.local_addr().unwrap();
        let sender_socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut dispatcher: Dispatcher<Counters> = Dispatcher::new().unwrap();
        let mut app = Counters::default();

        // The listener mutes itself after the first event.
        let fd = receiver.as_raw_fd();
        let key_cell = std::rc::Rc::new(std::cell::Cell::new(0));
        let key_for_callback = key_cell.clone();
        let key = dispatcher.add_io_listener(fd, Mask::READ, move |app, api, _| {
            let mut buffer = [0u8; 16];
            while receiver.recv_from(&mut buffer).is_ok() {
                app.io_fires += 1;
            }
            api.set_io_mask(key_for_callback.get(), Mask::NONE);
            false
        });
        key_cell.set(key);

        sender_socket.send_to(&[1], address).unwrap();
        for _ in 0..100 {
            dispatcher.run_once(&mut app, Some(Duration::from_millis(10)));
            if app.io_fires > 0 {
                break;
            }
        }
        assert_eq!(app.io_fires, 1);

        // Muted: further datagrams do not dispatch.
        sender_socket.send_to(&[2], address).unwrap();
        for _ in 0..5 {
            dispatcher.run_once(&mut app, Some(Duration::from_millis(10)));
        }
        assert_eq!(app.io_fires, 1);
    }

    #[test]
    fn test_stopper_halts_run_from_other_thread() {
        let mut dispatcher: Dispatcher<Counters> = Dispatcher::new().unwrap();
        let mut app = Counters::default();

        let stopper = dispatcher.stopper();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            stopper.stop();
        });

        dispatcher.run(&mut app);
        worker.join().unwrap();
        assert!(dispatcher.stopped());
    }
}
