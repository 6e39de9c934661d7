//! The in-flight call map.
//!
//! Every outgoing call registers a one-shot completion under its unique
//! call key. A key leaves the map in bounded time: when the matching
//! `rpc_result` arrives, when the invocation times out, or when the
//! whole map is failed on disconnect. After [PendingCalls::fail_all] the
//! map refuses new registrations so late invocations fail fast.

use chashmap::CHashMap;
use futures::channel::oneshot;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{LifecycleError, RemoteInvocationError};
use crate::guid::Guid;
use crate::message::MethodCallResultMessage;

pub(crate) type CallOutcome = Result<MethodCallResultMessage, RemoteInvocationError>;

pub(crate) struct PendingCalls {
    entries: CHashMap<Guid, oneshot::Sender<CallOutcome>>,
    closed: AtomicBool,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            entries: CHashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn register(&self, key: Guid) -> Result<oneshot::Receiver<CallOutcome>, LifecycleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LifecycleError::NotConnected);
        }
        let (sender, receiver) = oneshot::channel();
        if self.entries.insert(key, sender).is_some() {
            return Err(LifecycleError::DuplicateCallKey { key });
        }
        // A disconnect may have raced the insert; make sure the entry
        // does not outlive the map.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(sender) = self.entries.remove(&key) {
                let _ = sender.send(Err(RemoteInvocationError::server_disconnected()));
            }
        }
        Ok(receiver)
    }

    /// Deliver an outcome; `false` when no call with this key waits.
    pub fn complete(&self, key: Guid, outcome: CallOutcome) -> bool {
        match self.entries.remove(&key) {
            Some(sender) => {
                let _ = sender.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a registration, e.g. after a local timeout.
    pub fn remove(&self, key: Guid) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Fail every in-flight call and refuse new ones.
    pub fn fail_all(&self, error: RemoteInvocationError) {
        self.closed.store(true, Ordering::SeqCst);
        let entries = self.entries.clear();
        for (_, sender) in entries {
            let _ = sender.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("in_flight", &self.entries.len())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
