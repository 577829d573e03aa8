//! Request/reply correlation for one connection.
//!
//! A waiter is keyed by the sequence number of the request it sent. Replies
//! name that sequence; a reply resolves a waiter only when both the sequence
//! and the reply kind match.

use crate::message::Message;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use von_types::{VonError, VonResult};

/// Reply kinds a waiter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Ack,
    /// HELLO-RESPONSE or HELLO-REJECT.
    Hello,
    MoveResponse,
    LeaveRecover,
}

impl Expect {
    pub fn accepts(self, message: &Message) -> bool {
        matches!(
            (self, message),
            (Expect::Ack, Message::Acknowledge(_))
                | (Expect::Hello, Message::HelloResponse(_))
                | (Expect::Hello, Message::HelloReject(_))
                | (Expect::MoveResponse, Message::MoveResponse(_))
                | (Expect::LeaveRecover, Message::LeaveRecover(_))
        )
    }
}

/// A correlated reply.
#[derive(Debug)]
pub struct Reply {
    /// Sequence of the packet that carried the reply (for acknowledging it).
    pub sequence: u64,
    pub message: Message,
}

/// Outcome of offering a reply to the waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    /// Nobody is waiting on that sequence.
    Unmatched,
    /// Someone is waiting on that sequence for a different kind of reply.
    WrongKind,
}

type Waiter = (Expect, oneshot::Sender<VonResult<Reply>>);

/// Outstanding waiters of one connection.
#[derive(Debug, Default)]
pub struct PendingReplies {
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the reply to `sequence`.
    pub fn register(&self, sequence: u64, expect: Expect) -> oneshot::Receiver<VonResult<Reply>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(sequence, (expect, tx));
        rx
    }

    /// Drop the waiter for `sequence`, if still present.
    pub fn cancel(&self, sequence: u64) {
        self.lock().remove(&sequence);
    }

    /// Offer a reply carried by packet `packet_sequence`.
    ///
    /// INVALID resolves any waiter on its sequence as [`VonError::Invalid`].
    pub fn resolve(&self, packet_sequence: u64, message: Message) -> Resolution {
        let Some(target) = message.reply_to() else {
            return Resolution::Unmatched;
        };
        let mut waiters = self.lock();
        let Some(expect) = waiters.get(&target).map(|(expect, _)| *expect) else {
            return Resolution::Unmatched;
        };

        let outcome = match message {
            Message::Invalid(invalid) => Err(VonError::Invalid {
                reason: invalid.reason,
            }),
            message if expect.accepts(&message) => Ok(Reply {
                sequence: packet_sequence,
                message,
            }),
            _ => return Resolution::WrongKind,
        };

        if let Some((_, tx)) = waiters.remove(&target) {
            // The waiter may have given up already.
            let _ = tx.send(outcome);
        }
        Resolution::Resolved
    }

    /// Fail every waiter with [`VonError::ConnectionClosed`].
    pub fn fail_all(&self) {
        for (_, (_, tx)) in self.lock().drain() {
            let _ = tx.send(Err(VonError::ConnectionClosed));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}
