//! The back-end→front-end message pipe.
//!
//! The network back end runs in the dispatcher thread; an interactive
//! front end consumes forwarded messages from its own loop. Ownership
//! of a buffer transfers to the front end the moment it is sent — the
//! pipe is the only place a message buffer crosses threads, and it
//! crosses unshared.

use crate::wire::cursor::MessageReader;
use crate::wire::MessageBuffer;
use crate::MessageId;
use hashbrown::HashMap;
use std::sync::mpsc;

/// One forwarded message: the buffer (header ID in native order) and
/// whether its body bytes still carry the server's foreign byte order.
pub struct FrontendEnvelope {
    pub buffer: MessageBuffer,
    pub swap_on_read: bool,
}

pub(crate) struct FrontendSender {
    sender: mpsc::Sender<FrontendEnvelope>,
}

impl FrontendSender {
    pub(crate) fn send(&self, envelope: FrontendEnvelope) {
        // The front end hanging up just means nobody is watching.
        let _ = self.sender.send(envelope);
    }
}

/// Front-end side of the pipe: per-message-ID handlers run by the
/// interactive thread when it calls [`dispatch`](Self::dispatch).
pub struct FrontendReceiver {
    receiver: mpsc::Receiver<FrontendEnvelope>,
    handlers: HashMap<MessageId, Box<dyn FnMut(MessageId, &mut MessageReader)>>,
}

pub(crate) fn frontend_pipe() -> (FrontendSender, FrontendReceiver) {
    let (sender, receiver) = mpsc::channel();
    (
        FrontendSender { sender },
        FrontendReceiver {
            receiver,
            handlers: HashMap::new(),
        },
    )
}

impl FrontendReceiver {
    /// Installs the handler for one forwarded message ID.
    pub fn set_handler<F>(&mut self, message_id: MessageId, handler: F)
    where
        F: FnMut(MessageId, &mut MessageReader) + 'static,
    {
        self.handlers.insert(message_id, Box::new(handler));
    }

    /// Runs handlers for every message queued since the last call;
    /// returns how many were dispatched. Never blocks.
    pub fn dispatch(&mut self) -> usize {
        let mut dispatched = 0;
        while let Ok(envelope) = self.receiver.try_recv() {
            let message_id = envelope.buffer.message_id();
            if let Some(handler) = self.handlers.get_mut(&message_id) {
                let mut reader = MessageReader::over_body(&envelope.buffer, envelope.swap_on_read);
                handler(message_id, &mut reader);
            }
            dispatched += 1;
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::cursor::{MessageWriter, WireRead};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_pipe_transfers_and_dispatches() {
        let (sender, mut receiver) = frontend_pipe();

        let mut writer = MessageWriter::with_capacity(99, 4);
        writer.write_u32(0xCAFE).unwrap();
        sender.send(FrontendEnvelope {
            buffer: writer.into_buffer(),
            swap_on_read: false,
        });

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        receiver.set_handler(99, move |id, reader| {
            sink.borrow_mut().push((id, reader.read_u32().unwrap()));
        });

        assert_eq!(receiver.dispatch(), 1);
        assert_eq!(*seen.borrow(), vec![(99, 0xCAFE)]);
        assert_eq!(receiver.dispatch(), 0);
    }

    #[test]
    fn test_pipe_crosses_threads() {
        let (sender, mut receiver) = frontend_pipe();

        let worker = std::thread::spawn(move || {
            let mut writer = MessageWriter::with_capacity(7, 2);
            writer.write_u16(123).unwrap();
            sender.send(FrontendEnvelope {
                buffer: writer.into_buffer(),
                swap_on_read: false,
            });
        });
        worker.join().unwrap();

        let count = Rc::new(RefCell::new(0u32));
        let sink = count.clone();
        receiver.set_handler(7, move |_, reader| {
            assert_eq!(reader.read_u16().unwrap(), 123);
            *sink.borrow_mut() += 1;
        });
        assert_eq!(receiver.dispatch(), 1);
        assert_eq!(*count.borrow(), 1);
    }
}
