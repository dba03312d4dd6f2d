//! 结果汇总。
//!
//! OutcomeRecord 到达的顺序不影响最终统计：计数与字节数是可交换的累加，
//! top-N 列表按 (键, id) 的全序做插入后截断，失败列表在 finalize 时按 id 排序。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::download::models::{FailureReason, ItemKind, OutcomeRecord};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl KindStats {
    pub fn success_rate(&self) -> f64 {
        rate(self.succeeded, self.total)
    }

    fn add(&mut self, ok: bool) {
        self.total += 1;
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopEntry {
    pub id: String,
    pub display_name: String,
    pub kind: ItemKind,
    pub succeeded: bool,
    pub bytes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub id: String,
    pub display_name: String,
    pub kind: ItemKind,
    pub reason: FailureReason,
    pub attempts: usize,
    pub last_error: Option<String>,
}

/// 报告中的会话元信息，由调用方在会话结束时补充。
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMeta {
    pub backup_path: PathBuf,
    pub workers: usize,
    pub timeout_secs: u64,
    pub generated_at: OffsetDateTime,
    pub interrupted: bool,
}

/// 冻结后的会话统计，Report Generator 的唯一输入。
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub total_attempts: usize,
    pub retried_items: usize,
    pub repositories: KindStats,
    pub gists: KindStats,
    pub top_by_size: Vec<TopEntry>,
    pub top_by_recency: Vec<TopEntry>,
    pub failures: Vec<FailureEntry>,
    pub meta: Option<SessionMeta>,
}

impl SessionStats {
    /// 空会话视为 100%。
    pub fn success_rate(&self) -> f64 {
        rate(self.succeeded, self.total_items)
    }

    pub fn with_meta(mut self, meta: SessionMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn kind(&self, kind: ItemKind) -> &KindStats {
        match kind {
            ItemKind::Repository => &self.repositories,
            ItemKind::Gist => &self.gists,
        }
    }
}

fn rate(part: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

/// 有界有序列表：键大者在前，键相同按 id 升序；超出容量的尾部直接丢弃。
#[derive(Debug, Clone)]
struct BoundedTop<K: Ord + Copy> {
    cap: usize,
    entries: Vec<(K, TopEntry)>,
}

impl<K: Ord + Copy> BoundedTop<K> {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: Vec::with_capacity(cap.saturating_add(1).min(64)),
        }
    }

    fn offer(&mut self, key: K, entry: TopEntry) {
        let pos = self
            .entries
            .partition_point(|(k, e)| *k > key || (*k == key && e.id < entry.id));
        if pos >= self.cap {
            return;
        }
        self.entries.insert(pos, (key, entry));
        self.entries.truncate(self.cap);
    }

    fn into_entries(self) -> Vec<TopEntry> {
        self.entries.into_iter().map(|(_, e)| e).collect()
    }
}

pub struct ResultAggregator {
    started: Instant,
    seen: HashSet<String>,
    succeeded: usize,
    failed: usize,
    total_bytes: u64,
    total_attempts: usize,
    retried_items: usize,
    repositories: KindStats,
    gists: KindStats,
    by_size: BoundedTop<u64>,
    by_recency: BoundedTop<OffsetDateTime>,
    failures: Vec<FailureEntry>,
}

impl ResultAggregator {
    pub fn new(top_n_size: usize, top_n_recent: usize) -> Self {
        Self {
            started: Instant::now(),
            seen: HashSet::new(),
            succeeded: 0,
            failed: 0,
            total_bytes: 0,
            total_attempts: 0,
            retried_items: 0,
            repositories: KindStats::default(),
            gists: KindStats::default(),
            by_size: BoundedTop::new(top_n_size),
            by_recency: BoundedTop::new(top_n_recent),
            failures: Vec::new(),
        }
    }

    /// 同一 id 只计一次；重复的记录返回 false。
    pub fn accumulate(&mut self, record: OutcomeRecord) -> bool {
        if !self.seen.insert(record.descriptor.id.clone()) {
            debug!(target: "report", id = %record.descriptor.id, "重复的结果记录，已忽略");
            return false;
        }

        let ok = record.succeeded();
        let d = record.descriptor;
        if ok {
            self.succeeded += 1;
            self.total_bytes += record.bytes_written;
        } else {
            self.failed += 1;
        }
        self.total_attempts += record.attempts.len();
        if record.attempts.len() > 1 {
            self.retried_items += 1;
        }
        match d.kind {
            ItemKind::Repository => self.repositories.add(ok),
            ItemKind::Gist => self.gists.add(ok),
        }

        let entry = TopEntry {
            id: d.id.clone(),
            display_name: d.display_name.clone(),
            kind: d.kind,
            succeeded: ok,
            bytes: if ok {
                record.bytes_written
            } else {
                d.size_hint.unwrap_or(0)
            },
            updated_at: d.updated_at,
        };
        if let Some(updated) = d.updated_at {
            self.by_recency.offer(updated, entry.clone());
        }
        self.by_size.offer(entry.bytes, entry);

        if !ok {
            let reason = match record.failure {
                Some(reason) => reason,
                None => {
                    warn!(target: "report", id = %d.id, "失败记录缺少原因，按网络错误计入");
                    FailureReason::Network
                }
            };
            self.failures.push(FailureEntry {
                id: d.id,
                display_name: d.display_name,
                kind: d.kind,
                reason,
                attempts: record.attempts.len(),
                last_error: record.last_error,
            });
        }
        true
    }

    pub fn finalize(self) -> SessionStats {
        let mut failures = self.failures;
        failures.sort_by(|a, b| a.id.cmp(&b.id));
        SessionStats {
            total_items: self.succeeded + self.failed,
            succeeded: self.succeeded,
            failed: self.failed,
            total_bytes: self.total_bytes,
            duration_ms: self.started.elapsed().as_millis().min(u64::MAX as u128) as u64,
            total_attempts: self.total_attempts,
            retried_items: self.retried_items,
            repositories: self.repositories,
            gists: self.gists,
            top_by_size: self.by_size.into_entries(),
            top_by_recency: self.by_recency.into_entries(),
            failures,
            meta: None,
        }
    }
}

/// 供多个 worker 并发写入的汇总器。
pub struct SharedAggregator {
    inner: Mutex<ResultAggregator>,
}

impl SharedAggregator {
    pub fn new(inner: ResultAggregator) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn accumulate(&self, record: OutcomeRecord) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .accumulate(record)
    }

    pub fn finalize(self) -> SessionStats {
        self.inner
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::{
        AttemptOutcome, AttemptRecord, FinalStatus, ItemDescriptor,
    };
    use rand::seq::SliceRandom;
    use std::sync::Arc;
    use time::macros::datetime;

    fn record(i: usize, ok: bool, bytes: u64, day: Option<u8>) -> OutcomeRecord {
        let kind = if i % 4 == 0 {
            ItemKind::Gist
        } else {
            ItemKind::Repository
        };
        let descriptor = ItemDescriptor {
            id: format!("id-{i:03}"),
            display_name: format!("me/project-{i}"),
            source_url: format!("https://example.invalid/{i}.zip"),
            fallback_urls: Vec::new(),
            size_hint: Some(bytes),
            updated_at: day.map(|d| datetime!(2025-01-01 0:00 UTC).replace_day(d).unwrap()),
            kind,
        };
        let attempts = (1..=if ok { 1 } else { 3 })
            .map(|n| AttemptRecord {
                attempt_number: n,
                started_at: datetime!(2025-06-01 12:00 UTC),
                delay_before_ms: 0,
                duration_ms: 5,
                outcome: if ok {
                    AttemptOutcome::Success
                } else {
                    AttemptOutcome::NetworkFailure
                },
            })
            .collect();
        OutcomeRecord {
            descriptor,
            final_status: if ok {
                FinalStatus::Succeeded
            } else {
                FinalStatus::Failed
            },
            attempts,
            bytes_written: if ok { bytes } else { 0 },
            total_duration_ms: 5,
            failure: (!ok).then_some(FailureReason::Network),
            last_error: (!ok).then(|| "connection reset".to_string()),
        }
    }

    fn fixture() -> Vec<OutcomeRecord> {
        vec![
            record(1, true, 500, Some(3)),
            record(2, true, 900, Some(9)),
            record(3, false, 700, None),
            record(4, true, 900, Some(9)),
            record(5, true, 10, Some(1)),
            record(6, false, 0, Some(20)),
            record(7, true, 4096, None),
            record(8, true, 900, Some(15)),
            record(9, true, 1, Some(2)),
            record(10, false, 50, Some(28)),
            record(11, true, 64, Some(9)),
            record(12, true, 2048, Some(11)),
        ]
    }

    fn stats_of(records: Vec<OutcomeRecord>) -> SessionStats {
        let mut agg = ResultAggregator::new(4, 3);
        for r in records {
            agg.accumulate(r);
        }
        agg.finalize()
    }

    #[test]
    fn counts_and_bytes() {
        let stats = stats_of(fixture());
        assert_eq!(stats.total_items, 12);
        assert_eq!(stats.succeeded, 9);
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.total_bytes, 500 + 900 + 900 + 10 + 4096 + 900 + 1 + 64 + 2048);
        assert_eq!(stats.gists.total, 3);
        assert_eq!(stats.repositories.total, 9);
        assert_eq!(stats.retried_items, 3);
        assert_eq!(stats.total_attempts, 9 + 9);
    }

    #[test]
    fn top_lists_are_bounded_and_tie_broken_by_id() {
        let stats = stats_of(fixture());
        let size_ids: Vec<_> = stats.top_by_size.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(size_ids, vec!["id-007", "id-012", "id-002", "id-004"]);

        let recent_ids: Vec<_> = stats
            .top_by_recency
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(recent_ids, vec!["id-010", "id-006", "id-008"]);
    }

    #[test]
    fn statistics_are_order_independent() {
        let baseline = stats_of(fixture());
        let mut rng = rand::thread_rng();
        for round in 0..20 {
            let mut records = fixture();
            if round == 0 {
                records.reverse();
            } else {
                records.shuffle(&mut rng);
            }
            let stats = stats_of(records);
            assert_eq!(stats.succeeded, baseline.succeeded);
            assert_eq!(stats.failed, baseline.failed);
            assert_eq!(stats.total_bytes, baseline.total_bytes);
            assert_eq!(stats.top_by_size, baseline.top_by_size);
            assert_eq!(stats.top_by_recency, baseline.top_by_recency);
            assert_eq!(stats.failures, baseline.failures);
        }
    }

    #[test]
    fn accumulate_is_idempotent_per_id() {
        let mut agg = ResultAggregator::new(10, 10);
        assert!(agg.accumulate(record(1, true, 100, None)));
        assert!(!agg.accumulate(record(1, true, 100, None)));
        assert!(!agg.accumulate(record(1, false, 100, None)));
        let stats = agg.finalize();
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.total_bytes, 100);
        assert_eq!(stats.top_by_size.len(), 1);
    }

    #[test]
    fn empty_session_is_fully_successful() {
        let stats = ResultAggregator::new(10, 5).finalize();
        assert_eq!(stats.total_items, 0);
        assert_eq!(stats.success_rate(), 100.0);
        assert!(stats.top_by_size.is_empty());
        assert!(stats.failures.is_empty());
    }

    #[test]
    fn failures_are_sorted_and_carry_reason() {
        let stats = stats_of(fixture());
        let ids: Vec<_> = stats.failures.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["id-003", "id-006", "id-010"]);
        assert!(stats.failures.iter().all(|f| f.reason == FailureReason::Network));
        assert!(stats.failures.iter().all(|f| f.attempts == 3));
    }

    #[test]
    fn concurrent_accumulate_loses_nothing() {
        let shared = Arc::new(SharedAggregator::new(ResultAggregator::new(5, 5)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let n = t * 50 + i;
                        shared.accumulate(record(n, n % 7 != 0, n as u64, None));
                        // 每个线程也重复提交一次相邻线程的条目
                        shared.accumulate(record((n + 50) % 400, true, 1, None));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = Arc::try_unwrap(shared)
            .unwrap_or_else(|_| panic!("still shared"))
            .finalize();
        assert_eq!(stats.total_items, 400);
        assert_eq!(stats.succeeded + stats.failed, 400);
    }

    #[test]
    fn failure_without_reason_is_still_listed() {
        let mut agg = ResultAggregator::new(5, 5);
        let mut bare = record(9, false, 10, None);
        bare.failure = None;
        assert!(agg.accumulate(bare));

        let stats = agg.finalize();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failures.len(), 1);
        assert_eq!(stats.failures[0].reason, FailureReason::Network);
        assert_eq!(stats.failures[0].attempts, 3);
    }
}
