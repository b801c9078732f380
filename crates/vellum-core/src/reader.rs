//! Read paths: stream reads, global reads, and locator rebuilds.
//!
//! Readers never block the writer. They snapshot what they need from the
//! index and segment table under brief shared locks, then read record bytes
//! through their own file handles. Positions beyond the published global
//! head are invisible even if their bytes are already in the file: the head
//! is only advanced after fsync.

use std::fs::File;
use std::sync::{Arc, PoisonError};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::index::LocatorQuery;
use crate::log::{LogShared, SYSTEM_TENANT};
use crate::record::EventRecord;
use crate::segment::read_event_at;

/// Shared-state reader handle. Cheap to clone; reads run on the caller's
/// thread.
#[derive(Clone)]
pub(crate) struct LogReader {
    shared: Arc<LogShared>,
}

impl LogReader {
    pub fn new(shared: Arc<LogShared>) -> Self {
        Self { shared }
    }

    /// Events of one stream in revision order, starting at `from_rev`
    /// (0 and 1 both mean "from the start"), at most `max_count`.
    ///
    /// Fails with `TenantMismatch` unless the presented tenant owns the
    /// stream or is the privileged system token.
    pub fn read_stream(
        &self,
        stream_id: &str,
        from_rev: u64,
        max_count: usize,
        tenant_id: &str,
    ) -> Result<Vec<EventRecord>> {
        let query = {
            let index = self
                .shared
                .index
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(state) = index.state(stream_id) else {
                return Err(StoreError::StreamNotFound {
                    stream: stream_id.to_string(),
                });
            };
            check_tenant(&state.tenant_id, tenant_id)?;
            index.locators(stream_id, from_rev, max_count)
        };

        let positions = match query {
            LocatorQuery::NoStream => {
                return Err(StoreError::StreamNotFound {
                    stream: stream_id.to_string(),
                });
            }
            LocatorQuery::Range(positions) => positions,
            LocatorQuery::Evicted => {
                let rebuilt = self.rebuild_locators(stream_id)?;
                let from = from_rev.max(1) as usize;
                let start = (from - 1).min(rebuilt.len());
                let end = rebuilt.len().min(start + max_count);
                let slice = rebuilt[start..end].to_vec();
                let mut index = self
                    .shared
                    .index
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                index.install_locators(stream_id, rebuilt);
                slice
            }
        };

        let events = self.fetch_positions(&positions)?;
        for event in &events {
            // The stream owner was already checked; this catches records
            // that disagree with the index.
            check_tenant(&event.tenant_id, tenant_id)?;
        }
        Ok(events)
    }

    /// Events in global-position order starting at `from_pos` (0 and 1 both
    /// mean "from the start"), at most `max_count`. Reaching the head
    /// returns a partial result, never an error.
    ///
    /// No tenant filter: callers of this form are trusted (projection
    /// coordinator, admin tooling).
    pub fn read_global(&self, from_pos: u64, max_count: usize) -> Result<Vec<EventRecord>> {
        let head = self.shared.head();
        let from = from_pos.max(1);
        if head == 0 || from > head || max_count == 0 {
            return Ok(Vec::new());
        }
        let last = head.min(from + max_count as u64 - 1);
        let positions: Vec<u64> = (from..=last).collect();
        self.fetch_positions(&positions)
    }

    /// Current revision of a stream, tenant-checked.
    pub fn get_stream_revision(&self, stream_id: &str, tenant_id: &str) -> Result<u64> {
        let index = self
            .shared
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(state) = index.state(stream_id) else {
            return Err(StoreError::StreamNotFound {
                stream: stream_id.to_string(),
            });
        };
        check_tenant(&state.tenant_id, tenant_id)?;
        Ok(state.current_rev)
    }

    /// The published global head (0 = empty store).
    pub fn head(&self) -> u64 {
        self.shared.head()
    }

    /// Read records for ascending global positions, grouping by segment so
    /// each file is opened once per run.
    fn fetch_positions(&self, positions: &[u64]) -> Result<Vec<EventRecord>> {
        let mut out = Vec::with_capacity(positions.len());
        let mut i = 0;
        while i < positions.len() {
            // Snapshot the run of positions living in one segment.
            let (path, run) = {
                let segments = self
                    .shared
                    .segments
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some((path, _)) = segments.locate(positions[i]) else {
                    return Err(StoreError::Corrupted {
                        segment: self.shared.events_dir.clone(),
                        offset: 0,
                        reason: format!("no segment holds position {}", positions[i]),
                    });
                };
                let mut run = Vec::new();
                for &pos in &positions[i..] {
                    match segments.locate(pos) {
                        Some((p, offset)) if p == path => run.push((pos, offset)),
                        _ => break,
                    }
                }
                (path, run)
            };

            let mut file = File::open(&path)?;
            for &(pos, offset) in &run {
                let record = read_event_at(&mut file, &path, offset)?;
                if record.global_pos != pos {
                    return Err(StoreError::Corrupted {
                        segment: path.clone(),
                        offset,
                        reason: format!(
                            "expected position {pos}, found {}",
                            record.global_pos
                        ),
                    });
                }
                out.push(record);
            }
            i += run.len();
        }
        Ok(out)
    }

    /// Rebuild a cold stream's locator list by scanning the segment chain.
    /// Bounded by the published head so unpublished bytes never leak in.
    fn rebuild_locators(&self, stream_id: &str) -> Result<Vec<u64>> {
        let head = self.shared.head();
        let segments: Vec<(std::path::PathBuf, Vec<u64>, u64)> = {
            let table = self
                .shared
                .segments
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            table
                .entries
                .iter()
                .map(|e| (e.path.clone(), e.offsets.clone(), e.first_pos))
                .collect()
        };

        let mut positions = Vec::new();
        for (path, offsets, first_pos) in segments {
            let mut file = File::open(&path)?;
            for (i, &offset) in offsets.iter().enumerate() {
                let pos = first_pos + i as u64;
                if pos > head {
                    break;
                }
                let record = read_event_at(&mut file, &path, offset)?;
                if record.stream_id == stream_id {
                    positions.push(record.global_pos);
                }
            }
        }
        debug!(
            stream = stream_id,
            revisions = positions.len(),
            "rebuilt locators for cold stream"
        );
        Ok(positions)
    }
}

fn check_tenant(owner: &str, presented: &str) -> Result<()> {
    if owner == presented || presented == SYSTEM_TENANT {
        Ok(())
    } else {
        Err(StoreError::TenantMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::log::{EventLog, ExpectedRevision};
    use tempfile::tempdir;

    fn test_config() -> StoreConfig {
        StoreConfig {
            locator_cache_streams: 4,
            ..StoreConfig::default()
        }
    }

    async fn seeded_log(root: &std::path::Path) -> EventLog {
        let log = EventLog::open(root, test_config()).unwrap();
        for i in 0..3u64 {
            log.append(
                "orders-1",
                &format!("cmd-{i}"),
                ExpectedRevision::Exact(i),
                vec![format!("order payload {i}").into_bytes()],
                "acme",
            )
            .await
            .unwrap();
        }
        log.append(
            "orders-2",
            "cmd-0",
            ExpectedRevision::NoStream,
            vec![b"other stream".to_vec()],
            "acme",
        )
        .await
        .unwrap();
        log
    }

    // ---- Stream reads ----

    #[tokio::test]
    async fn read_stream_returns_revision_order() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path()).await;
        let reader = LogReader::new(log.shared());

        let events = reader.read_stream("orders-1", 0, 10, "acme").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.stream_rev).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(events.iter().all(|e| e.stream_id == "orders-1"));
        log.close().await;
    }

    #[tokio::test]
    async fn read_stream_honours_from_rev_and_max() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path()).await;
        let reader = LogReader::new(log.shared());

        let events = reader.read_stream("orders-1", 2, 1, "acme").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream_rev, 2);

        let past_head = reader.read_stream("orders-1", 9, 5, "acme").unwrap();
        assert!(past_head.is_empty());
        log.close().await;
    }

    #[tokio::test]
    async fn unknown_stream_is_an_error() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path()).await;
        let reader = LogReader::new(log.shared());

        let err = reader.read_stream("nope", 0, 10, "acme").unwrap_err();
        assert!(matches!(err, StoreError::StreamNotFound { .. }));
        log.close().await;
    }

    // ---- Tenant isolation ----

    #[tokio::test]
    async fn wrong_tenant_is_rejected_system_passes() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path()).await;
        let reader = LogReader::new(log.shared());

        let err = reader.read_stream("orders-1", 0, 10, "rival").unwrap_err();
        assert!(matches!(err, StoreError::TenantMismatch));

        let err = reader.get_stream_revision("orders-1", "rival").unwrap_err();
        assert!(matches!(err, StoreError::TenantMismatch));

        let events = reader.read_stream("orders-1", 0, 10, "system").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(reader.get_stream_revision("orders-1", "system").unwrap(), 3);
        log.close().await;
    }

    // ---- Global reads ----

    #[tokio::test]
    async fn read_global_is_position_ordered_and_partial_at_head() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path()).await;
        let reader = LogReader::new(log.shared());

        let events = reader.read_global(1, 100).unwrap();
        assert_eq!(events.len(), 4);
        let positions: Vec<u64> = events.iter().map(|e| e.global_pos).collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);

        // Beyond the head: partial result, not an error.
        let tail = reader.read_global(4, 100).unwrap();
        assert_eq!(tail.len(), 1);
        let none = reader.read_global(99, 100).unwrap();
        assert!(none.is_empty());
        log.close().await;
    }

    // ---- Locator rebuild ----

    #[tokio::test]
    async fn evicted_stream_is_rebuilt_transparently() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), test_config()).unwrap();
        // Cache cap is 4: streams s-0..s-5 evict the earliest ones.
        for s in 0..6u64 {
            log.append(
                &format!("s-{s}"),
                "c-0",
                ExpectedRevision::NoStream,
                vec![vec![s as u8; 8]],
                "t",
            )
            .await
            .unwrap();
        }
        let reader = LogReader::new(log.shared());

        let events = reader.read_stream("s-0", 0, 10, "t").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream_id, "s-0");
        assert_eq!(events[0].global_pos, 1);
        log.close().await;
    }

    #[tokio::test]
    async fn get_stream_revision_reports_head() {
        let dir = tempdir().unwrap();
        let log = seeded_log(dir.path()).await;
        let reader = LogReader::new(log.shared());
        assert_eq!(reader.get_stream_revision("orders-1", "acme").unwrap(), 3);
        assert_eq!(reader.get_stream_revision("orders-2", "acme").unwrap(), 1);
        log.close().await;
    }
}
