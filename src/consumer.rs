//! Consumers of a connection's decoded message stream.
//!
//! The framer hands messages over in completion order, interleaving both
//! directions. It does not pair requests with responses; a consumer that
//! wants per-query reports has to follow the conversation itself, which is
//! what [`QueryWatcher`] does.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::protocol::messages::{
    bind_target, close_target, command_tag, command_tag_rows, execute_portal,
    parse_error_response, parse_statement, query_text, startup_parameters,
};
use crate::protocol::{Direction, MessageKind, ProtocolMessage};
use crate::proxy::{ConnectionId, MessageReceiver};

/// Receives every message decoded on one connection.
pub trait MessageConsumer: Send + 'static {
    fn on_message(&mut self, msg: ProtocolMessage);

    /// Called once the connection is gone and the stream is drained.
    fn on_close(&mut self) {}
}

/// Adapts a closure into a [`MessageConsumer`].
pub struct FnConsumer<F>(pub F);

impl<F> MessageConsumer for FnConsumer<F>
where
    F: FnMut(ProtocolMessage) + Send + 'static,
{
    fn on_message(&mut self, msg: ProtocolMessage) {
        (self.0)(msg)
    }
}

pub fn consumer_fn<F>(f: F) -> FnConsumer<F>
where
    F: FnMut(ProtocolMessage) + Send + 'static,
{
    FnConsumer(f)
}

/// Feed `consumer` until the connection's message channel closes.
pub async fn drain<C: MessageConsumer>(mut messages: MessageReceiver, mut consumer: C) {
    while let Some(msg) = messages.recv().await {
        consumer.on_message(msg);
    }
    consumer.on_close();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Completed { command_tag: String },
    Empty,
    /// `Execute` hit its row limit; the portal can be resumed.
    Suspended,
    Failed { error: String },
}

impl fmt::Display for QueryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOutcome::Completed { command_tag } => f.write_str(command_tag),
            QueryOutcome::Empty => f.write_str("empty query"),
            QueryOutcome::Suspended => f.write_str("portal suspended"),
            QueryOutcome::Failed { error } => write!(f, "error: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReport {
    pub query: String,
    /// Prepared statement name, for named extended-protocol statements.
    pub statement: Option<String>,
    pub outcome: QueryOutcome,
    /// `DataRow` messages seen for this query, or the count its command tag
    /// reports when no rows came back (`INSERT 0 5`, `UPDATE 2`, `COPY 9`).
    pub rows: u64,
    /// From capture of the request to capture of its completion.
    pub elapsed: Duration,
}

#[derive(Debug)]
struct Pending {
    query: String,
    statement: Option<String>,
    simple: bool,
    started: Instant,
    rows: u64,
    failed: bool,
}

#[derive(Debug)]
enum Slot {
    Statement(Pending),
    Sync,
}

/// Logs each query with its row count and latency.
///
/// Requests are queued as they are seen (`Query`, or `Execute` of a bound
/// portal) and matched against responses in order, so pipelined extended
/// protocol traffic is attributed correctly. After an error in an extended
/// batch the server skips to the next `Sync`, and so does the watcher.
#[derive(Debug)]
pub struct QueryWatcher {
    conn_id: ConnectionId,
    statements: HashMap<String, String>,
    portals: HashMap<String, String>,
    queue: VecDeque<Slot>,
}

impl QueryWatcher {
    pub fn new(conn_id: ConnectionId) -> Self {
        Self {
            conn_id,
            statements: HashMap::new(),
            portals: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Number of requests still waiting for their response.
    pub fn in_flight(&self) -> usize {
        self.queue
            .iter()
            .filter(|slot| matches!(slot, Slot::Statement(_)))
            .count()
    }

    /// Track one message; returns a report when it finishes a query.
    pub fn observe(&mut self, msg: &ProtocolMessage) -> Option<QueryReport> {
        match (msg.direction, msg.kind) {
            (Direction::Request, MessageKind::StartupMessage) => {
                for (key, value) in startup_parameters(&msg.payload) {
                    if matches!(key.as_str(), "user" | "database" | "application_name") {
                        tracing::info!(conn_id = %self.conn_id, "{key}={value}");
                    }
                }
                None
            }
            (Direction::Request, MessageKind::Query) => {
                self.push(query_text(&msg.payload), None, true, msg.captured_at);
                None
            }
            (Direction::Request, MessageKind::Parse) => {
                if let Some((name, sql)) = parse_statement(&msg.payload) {
                    self.statements.insert(name, sql);
                }
                None
            }
            (Direction::Request, MessageKind::Bind) => {
                if let Some((portal, statement)) = bind_target(&msg.payload) {
                    self.portals.insert(portal, statement);
                }
                None
            }
            (Direction::Request, MessageKind::Execute) => {
                let portal = execute_portal(&msg.payload).unwrap_or_default();
                let statement = self.portals.get(&portal).cloned().unwrap_or_default();
                let query = self
                    .statements
                    .get(&statement)
                    .cloned()
                    .unwrap_or_else(|| format!("<unknown statement {statement:?}>"));
                let name = (!statement.is_empty()).then_some(statement);
                self.push(query, name, false, msg.captured_at);
                None
            }
            (Direction::Request, MessageKind::Sync) => {
                self.queue.push_back(Slot::Sync);
                None
            }
            (Direction::Request, MessageKind::Close) => {
                match close_target(&msg.payload) {
                    Some((b'S', name)) => {
                        self.statements.remove(&name);
                    }
                    Some((b'P', name)) => {
                        self.portals.remove(&name);
                    }
                    _ => {}
                }
                None
            }
            (Direction::Response, MessageKind::DataRow) => {
                if let Some(Slot::Statement(p)) = self.queue.front_mut() {
                    p.rows += 1;
                }
                None
            }
            (Direction::Response, MessageKind::CommandComplete) => self.complete(
                QueryOutcome::Completed {
                    command_tag: command_tag(&msg.payload),
                },
                msg.captured_at,
            ),
            (Direction::Response, MessageKind::EmptyQueryResponse) => {
                self.complete(QueryOutcome::Empty, msg.captured_at)
            }
            (Direction::Response, MessageKind::PortalSuspended) => {
                self.complete(QueryOutcome::Suspended, msg.captured_at)
            }
            (Direction::Response, MessageKind::ErrorResponse) => {
                self.fail(parse_error_response(&msg.payload), msg.captured_at)
            }
            (Direction::Response, MessageKind::ReadyForQuery) => {
                self.settle();
                None
            }
            _ => None,
        }
    }

    fn push(&mut self, query: String, statement: Option<String>, simple: bool, started: Instant) {
        self.queue.push_back(Slot::Statement(Pending {
            query,
            statement,
            simple,
            started,
            rows: 0,
            failed: false,
        }));
    }

    fn report(p: &Pending, outcome: QueryOutcome, at: Instant) -> QueryReport {
        QueryReport {
            query: p.query.clone(),
            statement: p.statement.clone(),
            outcome,
            rows: p.rows,
            elapsed: at.saturating_duration_since(p.started),
        }
    }

    fn complete(&mut self, outcome: QueryOutcome, at: Instant) -> Option<QueryReport> {
        let Some(Slot::Statement(p)) = self.queue.front_mut() else {
            return None;
        };
        let mut report = Self::report(p, outcome, at);
        if let QueryOutcome::Completed { command_tag } = &report.outcome
            && report.rows == 0
        {
            report.rows = command_tag_rows(command_tag).unwrap_or(0);
        }
        if p.simple {
            // A simple query may hold several statements; it ends at ReadyForQuery.
            p.rows = 0;
        } else {
            self.queue.pop_front();
        }
        Some(report)
    }

    fn fail(&mut self, error: String, at: Instant) -> Option<QueryReport> {
        let Some(Slot::Statement(p)) = self.queue.front_mut() else {
            tracing::warn!(conn_id = %self.conn_id, "server error: {error}");
            return None;
        };
        if p.failed {
            return None;
        }
        let report = Self::report(p, QueryOutcome::Failed { error }, at);
        if p.simple {
            p.failed = true;
        } else {
            while let Some(Slot::Statement(_)) = self.queue.front() {
                self.queue.pop_front();
            }
        }
        Some(report)
    }

    fn settle(&mut self) {
        while let Some(slot) = self.queue.pop_front() {
            match slot {
                Slot::Sync => break,
                Slot::Statement(p) if p.simple => break,
                Slot::Statement(_) => {}
            }
        }
    }
}

impl MessageConsumer for QueryWatcher {
    fn on_message(&mut self, msg: ProtocolMessage) {
        let Some(report) = self.observe(&msg) else {
            return;
        };
        tracing::info!(
            conn_id = %self.conn_id,
            rows = report.rows,
            elapsed_ms = report.elapsed.as_secs_f64() * 1000.0,
            outcome = %report.outcome,
            "{}",
            report.query
        );
    }

    fn on_close(&mut self) {
        let pending = self.in_flight();
        if pending > 0 {
            tracing::debug!(conn_id = %self.conn_id, pending, "closed with queries in flight");
        }
    }
}
