//! In-process negotiation backend for tests
//!
//! [`MockSessionFactory`] hands out sessions that record every call made on
//! them. Offers and answers are "generated" synchronously and reported
//! through the session's sink, so a test drives the whole negotiation by
//! emitting the remaining events (state changes, data channel open, data)
//! itself through [`MockSessionFactory::latest_sink`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::session::{
    EventSink, IceServer, NegotiationSession, SessionError, SessionEventKind, SessionFactory,
    SignalingMessage,
};

/// Everything a mock session was asked to do
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SessionCalls {
    pub data_channels: usize,
    pub offers: usize,
    pub remote_offers: Vec<String>,
    pub remote_answers: Vec<String>,
    pub candidates: Vec<serde_json::Value>,
    pub sent: Vec<Vec<u8>>,
    pub stats_requests: usize,
    pub closed: bool,
}

struct Record {
    sink: EventSink,
    ice_servers: Vec<IceServer>,
    calls: Rc<RefCell<SessionCalls>>,
}

/// Factory for recording sessions
#[derive(Default)]
pub struct MockSessionFactory {
    sessions: RefCell<Vec<Record>>,
    fail_create: Cell<bool>,
}

impl MockSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.set(fail);
    }

    /// Number of sessions successfully created so far
    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    /// Snapshot of the calls recorded on session `index` (creation order)
    ///
    /// # Panics
    ///
    /// If no such session was created.
    pub fn calls(&self, index: usize) -> SessionCalls {
        self.sessions.borrow()[index].calls.borrow().clone()
    }

    /// Event sink of the newest session
    pub fn latest_sink(&self) -> Option<EventSink> {
        self.sessions.borrow().last().map(|r| r.sink.clone())
    }

    /// Relay servers session `index` was created with
    pub fn ice_servers(&self, index: usize) -> Vec<IceServer> {
        self.sessions.borrow()[index].ice_servers.clone()
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        sink: EventSink,
        ice_servers: &[IceServer],
    ) -> Result<Box<dyn NegotiationSession>, SessionError> {
        if self.fail_create.get() {
            return Err(SessionError::Create("mock factory set to fail".into()));
        }

        let mut sessions = self.sessions.borrow_mut();
        let calls = Rc::new(RefCell::new(SessionCalls::default()));
        sessions.push(Record {
            sink: sink.clone(),
            ice_servers: ice_servers.to_vec(),
            calls: Rc::clone(&calls),
        });

        Ok(Box::new(MockSession {
            number: sessions.len(),
            sink,
            calls,
        }))
    }
}

/// Recording session; `number` is its 1-based creation index
struct MockSession {
    number: usize,
    sink: EventSink,
    calls: Rc<RefCell<SessionCalls>>,
}

impl NegotiationSession for MockSession {
    fn create_data_channel(&mut self) -> Result<(), SessionError> {
        self.calls.borrow_mut().data_channels += 1;
        Ok(())
    }

    fn create_offer(&mut self) -> Result<(), SessionError> {
        self.calls.borrow_mut().offers += 1;
        self.sink
            .emit(SessionEventKind::LocalDescription(SignalingMessage::Offer {
                sdp: format!("mock-offer-{}", self.number),
            }));
        Ok(())
    }

    fn apply_offer(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.calls.borrow_mut().remote_offers.push(sdp.to_string());
        self.sink
            .emit(SessionEventKind::LocalDescription(SignalingMessage::Answer {
                sdp: format!("mock-answer-{}", self.number),
            }));
        Ok(())
    }

    fn apply_answer(&mut self, sdp: &str) -> Result<(), SessionError> {
        self.calls.borrow_mut().remote_answers.push(sdp.to_string());
        Ok(())
    }

    fn add_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), SessionError> {
        self.calls.borrow_mut().candidates.push(candidate.clone());
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.calls.borrow_mut().sent.push(data.to_vec());
        Ok(())
    }

    fn request_stats(&mut self) {
        self.calls.borrow_mut().stats_requests += 1;
    }

    fn close(&mut self) {
        self.calls.borrow_mut().closed = true;
    }
}
