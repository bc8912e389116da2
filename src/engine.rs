use crate::correlator::{group_by_request, Correlation};
use crate::decoder::{decode_reader, DecodeDiagnostics, EventRecord, LineDecoder};
use crate::reconstruct::{reconstruct_group, ReconstructStats, ReconstructedRecord};
use crate::session::{IngestDiagnostics, Session, SessionStore};
use crate::summary::RequestSummary;
use crate::types::*;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Output of one pass over a log: records in first-seen order plus what was dropped.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub records: Vec<ReconstructedRecord>,
    pub diagnostics: IngestDiagnostics,
}

fn finish(correlation: Correlation, decode: DecodeDiagnostics) -> IngestOutcome {
    let mut stats = ReconstructStats::default();
    let records: Vec<ReconstructedRecord> = correlation
        .groups
        .iter()
        .map(|g| reconstruct_group(g, &mut stats))
        .collect();

    let diagnostics = IngestDiagnostics {
        total_lines: decode.total_lines,
        blank_lines: decode.blank_lines,
        skipped_lines: decode.skipped_lines,
        unassigned_events: correlation.unassigned,
        skipped_fragments: stats.skipped_fragments,
        duplicate_events: stats.duplicate_events,
        requests: records.len(),
        samples: decode.samples,
    };

    tracing::info!(
        lines = diagnostics.total_lines,
        skipped_lines = diagnostics.skipped_lines,
        unassigned = diagnostics.unassigned_events,
        skipped_fragments = diagnostics.skipped_fragments,
        requests = diagnostics.requests,
        "Ingested log"
    );

    IngestOutcome {
        records,
        diagnostics,
    }
}

/// Run the full pipeline over an in-memory upload. Never fails: bad lines and
/// fragments are counted, and an empty log yields zero records.
#[tracing::instrument(name = "ingest", skip_all, fields(bytes = bytes.len()))]
pub fn ingest(bytes: &[u8]) -> IngestOutcome {
    let content = String::from_utf8_lossy(bytes);
    let mut decoder = LineDecoder::new(&content);
    let correlation = group_by_request(decoder.by_ref());
    finish(correlation, decoder.into_diagnostics())
}

/// Same pipeline over an async source, used for reading log files from disk.
pub async fn ingest_reader<R>(reader: R) -> IngestOutcome
where
    R: AsyncRead + Unpin,
{
    let (events, decode): (Vec<EventRecord>, DecodeDiagnostics) = decode_reader(reader).await;
    finish(group_by_request(events), decode)
}

/// Boundary operations over a shared session store.
#[derive(Clone)]
pub struct RetraceEngine {
    store: Arc<dyn SessionStore>,
}

impl RetraceEngine {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn create_session(&self, bytes: &[u8]) -> (SessionId, IngestDiagnostics) {
        let outcome = ingest(bytes);
        let session = Session::new(outcome.records, outcome.diagnostics);
        let diagnostics = session.diagnostics.clone();
        let id = self.store.insert(session);
        tracing::info!(session = %id.short(), requests = diagnostics.requests, "Session created");
        (id, diagnostics)
    }

    pub fn list_summaries(&self, session_id: &str) -> Vec<RequestSummary> {
        match self.store.get(session_id) {
            Some(session) => session.summaries(),
            None => Vec::new(),
        }
    }

    pub fn get_record(&self, session_id: &str, req_id: &str) -> Result<Arc<ReconstructedRecord>> {
        let session = match self.store.get(session_id) {
            Some(s) => s,
            None => {
                tracing::debug!("Unknown session {}", crate::str_utils::prefix_chars(session_id, 8));
                return Err(RetraceError::NotFound("Request not found".into()).into());
            }
        };
        match session.record(req_id) {
            Some(record) => Ok(record),
            None => Err(RetraceError::NotFound("Request not found".into()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;

    fn engine() -> RetraceEngine {
        RetraceEngine::new(Arc::new(MemorySessionStore::new(None, 8)))
    }

    #[test]
    fn test_empty_input_creates_empty_session() {
        let engine = engine();
        let (id, diag) = engine.create_session(b"");
        assert_eq!(diag.requests, 0);
        assert!(engine.list_summaries(id.as_str()).is_empty());
        assert!(engine.store().get(id.as_str()).is_some());
    }

    #[test]
    fn test_all_invalid_input_still_succeeds() {
        let engine = engine();
        let (id, diag) = engine.create_session(b"garbage\n{\"unterminated\": \n\xff\xfe\n");
        assert_eq!(diag.skipped_lines, 3);
        assert_eq!(diag.requests, 0);
        assert!(engine.list_summaries(id.as_str()).is_empty());
    }

    #[test]
    fn test_lookups_report_not_found() {
        let engine = engine();
        let (id, _) = engine.create_session(b"{\"time\":1,\"reqId\":\"r1\",\"msg\":\"incoming request\",\"req\":{\"method\":\"POST\",\"url\":\"/v1/messages\"}}\n");

        assert!(engine.list_summaries("no-such-session").is_empty());
        assert!(engine.get_record(id.as_str(), "r1").is_ok());

        for (sid, rid) in [("no-such-session", "r1"), (id.as_str(), "missing")] {
            match engine.get_record(sid, rid) {
                Err(e) => assert!(matches!(e.inner, RetraceError::NotFound(_))),
                Ok(_) => panic!("Expected NotFound for {}/{}", sid, rid),
            }
        }
    }

    #[test]
    fn test_unassigned_events_are_counted() {
        let outcome = ingest(b"{\"time\":1,\"msg\":\"server listening\"}\n{\"time\":2,\"reqId\":\"r1\"}\n");
        assert_eq!(outcome.diagnostics.unassigned_events, 1);
        assert_eq!(outcome.records.len(), 1);
    }
}
