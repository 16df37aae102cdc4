//! Submit-buffer logging interface.
//!
//! The engine never writes log files itself; it submits opaque buffers to
//! one of five logger instances (connect, content, cert, masterkey, pcap),
//! each backed by a [`Queue`](crate::queue::Queue). The actual file/pcap
//! writers are external collaborators living outside this crate.

use crate::queue::Queue;
use std::sync::Arc;
use tracing::warn;

/// Priority hint carried alongside a submitted buffer, mirroring the C
/// submit-buffer descriptor's priority field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogPriority {
    Normal,
    High,
}

/// Which logger a record is destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Connect,
    Content,
    Cert,
    Masterkey,
    Pcap,
}

/// An opaque buffer descriptor submitted to a logger queue. The engine does
/// not interpret `bytes`; shape is owned by the external logger contract.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: LogKind,
    pub priority: LogPriority,
    pub bytes: Vec<u8>,
    /// Optional file-handle hint (e.g. a pcap rotation tag), opaque here.
    pub file_hint: Option<String>,
}

impl LogRecord {
    pub fn connect(line: impl Into<String>) -> Self {
        Self {
            kind: LogKind::Connect,
            priority: LogPriority::Normal,
            bytes: line.into().into_bytes(),
            file_hint: None,
        }
    }

    pub fn content(kind: LogKind, bytes: Vec<u8>) -> Self {
        Self { kind, priority: LogPriority::Normal, bytes, file_hint: None }
    }
}

/// Five named logger instances, each a bounded queue the engine submits to
/// and an external consumer (the out-of-scope logger process) drains.
pub struct LogSinks {
    pub connect: Arc<Queue<LogRecord>>,
    pub content: Arc<Queue<LogRecord>>,
    pub cert: Arc<Queue<LogRecord>>,
    pub masterkey: Arc<Queue<LogRecord>>,
    pub pcap: Arc<Queue<LogRecord>>,
}

impl LogSinks {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connect: Arc::new(Queue::new(queue_capacity)),
            content: Arc::new(Queue::new(queue_capacity)),
            cert: Arc::new(Queue::new(queue_capacity)),
            masterkey: Arc::new(Queue::new(queue_capacity)),
            pcap: Arc::new(Queue::new(queue_capacity)),
        }
    }

    fn sink_for(&self, kind: LogKind) -> &Arc<Queue<LogRecord>> {
        match kind {
            LogKind::Connect => &self.connect,
            LogKind::Content => &self.content,
            LogKind::Cert => &self.cert,
            LogKind::Masterkey => &self.masterkey,
            LogKind::Pcap => &self.pcap,
        }
    }

    /// Submits a record, blocking under backpressure: capacity overflow
    /// applies backpressure via a blocking enqueue. During shutdown the
    /// queue has already been unblocked so this degrades to best-effort.
    pub fn submit(&self, record: LogRecord) {
        let kind = record.kind;
        if self.sink_for(kind).enqueue(record).is_err() {
            warn!(?kind, "log queue shut down, dropping record");
        }
    }

    /// Shuts all five queues down in the producers-first-then-consumers
    /// order mandated by the queue's own contract.
    pub fn shutdown(&self) {
        for q in [&self.connect, &self.content, &self.cert, &self.masterkey, &self.pcap] {
            q.unblock_enqueue();
        }
        for q in [&self.connect, &self.content, &self.cert, &self.masterkey, &self.pcap] {
            q.unblock_dequeue();
        }
    }
}
