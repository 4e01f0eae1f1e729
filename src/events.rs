//! Controller events
//!
//! The core narrates circuit, stream, link and guard lifecycle transitions
//! as typed events. The embedding application drains them from the node
//! and forwards them to whatever controller surface it exposes.

use crate::netdir::RelayId;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircStatus {
    Launched,
    Extended,
    Built,
    Failed,
    Closed,
}

impl CircStatus {
    pub fn token(self) -> &'static str {
        match self {
            CircStatus::Launched => "LAUNCHED",
            CircStatus::Extended => "EXTENDED",
            CircStatus::Built => "BUILT",
            CircStatus::Failed => "FAILED",
            CircStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    SentConnect,
    Connected,
    Closed,
    Failed,
}

impl StreamStatus {
    pub fn token(self) -> &'static str {
        match self {
            StreamStatus::New => "NEW",
            StreamStatus::SentConnect => "SENTCONNECT",
            StreamStatus::Connected => "CONNECTED",
            StreamStatus::Closed => "CLOSED",
            StreamStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrConnStatus {
    Launched,
    Connected,
    Failed,
    Closed,
}

impl OrConnStatus {
    pub fn token(self) -> &'static str {
        match self {
            OrConnStatus::Launched => "LAUNCHED",
            OrConnStatus::Connected => "CONNECTED",
            OrConnStatus::Failed => "FAILED",
            OrConnStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStatus {
    New,
    Up,
    Down,
    Dropped,
    Bad,
    Good,
}

impl GuardStatus {
    pub fn token(self) -> &'static str {
        match self {
            GuardStatus::New => "NEW",
            GuardStatus::Up => "UP",
            GuardStatus::Down => "DOWN",
            GuardStatus::Dropped => "DROPPED",
            GuardStatus::Bad => "BAD",
            GuardStatus::Good => "GOOD",
        }
    }
}

/// One controller event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Circ {
        id: u64,
        status: CircStatus,
        reason: Option<String>,
    },
    Stream {
        circuit: u64,
        stream: u16,
        status: StreamStatus,
        reason: Option<String>,
    },
    OrConn {
        link: u64,
        status: OrConnStatus,
        reason: Option<String>,
    },
    Guard {
        identity: RelayId,
        status: GuardStatus,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Circ { id, status, reason } => {
                write!(f, "CIRC {} {}", id, status.token())?;
                if let Some(r) = reason {
                    write!(f, " REASON={}", r)?;
                }
                Ok(())
            }
            Event::Stream {
                circuit,
                stream,
                status,
                reason,
            } => {
                write!(f, "STREAM {}.{} {}", circuit, stream, status.token())?;
                if let Some(r) = reason {
                    write!(f, " REASON={}", r)?;
                }
                Ok(())
            }
            Event::OrConn { link, status, reason } => {
                write!(f, "ORCONN {} {}", link, status.token())?;
                if let Some(r) = reason {
                    write!(f, " REASON={}", r)?;
                }
                Ok(())
            }
            Event::Guard { identity, status } => {
                write!(f, "GUARD {} {}", identity, status.token())
            }
        }
    }
}

/// Accumulates events until the embedder drains them.
#[derive(Debug, Default)]
pub struct EventSink {
    queue: VecDeque<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        log::debug!("event: {}", event);
        self.queue.push_back(event);
    }

    pub fn circ(&mut self, id: u64, status: CircStatus, reason: Option<String>) {
        self.push(Event::Circ { id, status, reason });
    }

    pub fn stream(&mut self, circuit: u64, stream: u16, status: StreamStatus, reason: Option<String>) {
        self.push(Event::Stream {
            circuit,
            stream,
            status,
            reason,
        });
    }

    pub fn or_conn(&mut self, link: u64, status: OrConnStatus, reason: Option<String>) {
        self.push(Event::OrConn { link, status, reason });
    }

    pub fn guard(&mut self, identity: RelayId, status: GuardStatus) {
        self.push(Event::Guard { identity, status });
    }

    /// Take every queued event.
    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let e = Event::Circ {
            id: 3,
            status: CircStatus::Built,
            reason: None,
        };
        assert_eq!(e.to_string(), "CIRC 3 BUILT");

        let e = Event::Stream {
            circuit: 3,
            stream: 7,
            status: StreamStatus::Failed,
            reason: Some("EXITPOLICY".into()),
        };
        assert_eq!(e.to_string(), "STREAM 3.7 FAILED REASON=EXITPOLICY");
    }

    #[test]
    fn sink_drains_in_order() {
        let mut sink = EventSink::new();
        sink.circ(1, CircStatus::Launched, None);
        sink.circ(1, CircStatus::Built, None);
        let events = sink.drain();
        assert_eq!(events.len(), 2);
        assert!(sink.is_empty());
        assert!(matches!(
            events[0],
            Event::Circ {
                status: CircStatus::Launched,
                ..
            }
        ));
    }
}
