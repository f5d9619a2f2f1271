//! Per-connection request assembly.
//!
//! A [`Connection`] is owned by the task serving one accepted socket and is the
//! only place its byte accumulator and processing state are touched. It turns
//! the fragmented inbound stream into at most one [`InboundRequest`]; the
//! server drives the remaining transitions as detection and the response
//! write complete.

use detection_proto::{find_end_marker, parse_document, DetectionRequest, ImageDetection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, nothing received yet.
    Awaiting,
    /// Bytes received but no complete request assembled.
    Accumulating,
    /// A request was handed to the detector.
    Processing,
    /// The detector resolved and the response is being written.
    Responding,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    DataReceived(usize),
    ParseSucceeded,
    DetectorResolved,
    WriteComplete,
    ClosedByPeer,
    /// The transport failed; nothing more can be read or written.
    Failed,
}

/// A fully assembled request, ready for processing.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRequest {
    Json(ImageDetection),
    /// Raw image bytes from a sender that predates the JSON envelope.
    Legacy(Vec<u8>),
    /// A complete JSON document that is not a valid envelope.
    Invalid(String),
}

#[derive(Debug)]
pub struct Connection {
    id: u64,
    state: ConnectionState,
    buffer: Vec<u8>,
}

impl Connection {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: ConnectionState::Awaiting,
            buffer: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_processing(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Processing | ConnectionState::Responding
        )
    }

    /// Appends a chunk and returns a request if the buffer just became one.
    ///
    /// A request completed while another is still in flight is dropped.
    pub fn on_data(&mut self, chunk: &[u8]) -> Option<InboundRequest> {
        self.transition(ConnectionEvent::DataReceived(chunk.len()));
        if self.state == ConnectionState::Closed {
            return None;
        }
        self.buffer.extend_from_slice(chunk);
        tracing::debug!(
            connection = self.id,
            "Received {} bytes, total buffer: {} bytes",
            chunk.len(),
            self.buffer.len()
        );

        let request = self.assemble()?;
        self.admit(request)
    }

    /// Handles the peer finishing its side of the stream.
    ///
    /// If nothing was assembled and nothing is in flight, whatever bytes
    /// remain are treated as a legacy request.
    pub fn on_peer_closed(&mut self) -> Option<InboundRequest> {
        if self.is_processing() || self.buffer.is_empty() {
            self.transition(ConnectionEvent::ClosedByPeer);
            return None;
        }
        if self.state == ConnectionState::Closed {
            return None;
        }

        tracing::debug!(
            connection = self.id,
            "Processing {} buffered bytes from connection end",
            self.buffer.len()
        );
        self.admit(InboundRequest::Legacy(self.buffer.clone()))
    }

    /// Handles a transport error. Buffered bytes are discarded and any
    /// request in flight loses its response.
    pub fn on_read_failed(&mut self) {
        tracing::debug!(
            connection = self.id,
            "Discarding {} buffered bytes after read failure",
            self.buffer.len()
        );
        self.buffer.clear();
        self.transition(ConnectionEvent::Failed);
    }

    pub fn on_detector_resolved(&mut self) {
        self.transition(ConnectionEvent::DetectorResolved);
    }

    pub fn on_write_complete(&mut self) {
        self.transition(ConnectionEvent::WriteComplete);
    }

    fn assemble(&self) -> Option<InboundRequest> {
        match parse_document::<DetectionRequest>(&self.buffer) {
            Ok(Some(DetectionRequest::ImageDetection(detection))) => {
                return Some(InboundRequest::Json(detection))
            }
            Ok(None) => {}
            Err(e) => return Some(InboundRequest::Invalid(e.to_string())),
        }

        match find_end_marker(&self.buffer) {
            Some(0) | None => None,
            Some(end) => Some(InboundRequest::Legacy(self.buffer[..end].to_vec())),
        }
    }

    fn admit(&mut self, request: InboundRequest) -> Option<InboundRequest> {
        if self.is_processing() || self.state == ConnectionState::Closed {
            tracing::debug!(
                connection = self.id,
                "Already processing, dropping additional request"
            );
            return None;
        }
        self.transition(ConnectionEvent::ParseSucceeded);
        Some(request)
    }

    fn transition(&mut self, event: ConnectionEvent) {
        use ConnectionState::*;

        let next = match (self.state, &event) {
            (Closed, _) | (_, ConnectionEvent::Failed) => Closed,
            (_, ConnectionEvent::ClosedByPeer) if self.is_processing() => self.state,
            (_, ConnectionEvent::ClosedByPeer) => Closed,
            (Awaiting, ConnectionEvent::DataReceived(_)) => Accumulating,
            (state, ConnectionEvent::DataReceived(_)) => state,
            (Awaiting | Accumulating, ConnectionEvent::ParseSucceeded) => Processing,
            (Processing, ConnectionEvent::DetectorResolved) => Responding,
            (Responding, ConnectionEvent::WriteComplete) => Closed,
            (state, _) => {
                tracing::warn!(
                    connection = self.id,
                    "Ignoring {:?} in state {:?}",
                    event,
                    state
                );
                state
            }
        };

        self.state = next;
    }
}
