//! In-memory connection handles for tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use roomlink_core::{Connection, ConnectionId, Frame, SendError};
use uuid::Uuid;

#[derive(Default)]
pub struct MockConnection {
    id: ConnectionId,
    closed: AtomicBool,
    fail_sends: AtomicBool,
    pub sent: Mutex<Vec<String>>,
    pub close_code: Mutex<Option<u16>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            ..Self::default()
        })
    }

    pub fn with_id(id: ConnectionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            ..Self::default()
        })
    }

    /// Simulate the transport going away without a close call.
    pub fn drop_transport(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| Frame::decode_str(s))
            .collect()
    }
}

impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, text: &str) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Failed("scripted failure".into()));
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn close(&self, code: u16, _reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        *self.close_code.lock().unwrap() = Some(code);
    }
}
