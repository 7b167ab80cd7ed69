//! Aggregate statistics over processed records.
//!
//! All counters are integers so that merging is commutative and associative:
//! the totals after a resumed run are identical to an uninterrupted one.
//! Scores are kept in fixed point (thousandths) for the same reason.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::types::{ProcessedRecord, RecordOutcome, Sex};

/// Fixed-point scale applied to comparison scores.
const SCORE_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SexBreakdown {
    pub female: u64,
    pub male: u64,
    pub unknown: u64,
}

impl SexBreakdown {
    fn add(&mut self, sex: Sex) {
        match sex {
            Sex::Female => self.female += 1,
            Sex::Male => self.male += 1,
            Sex::Unknown => self.unknown += 1,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.female += other.female;
        self.male += other.male;
        self.unknown += other.unknown;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeHistogram {
    pub under_18: u64,
    pub from_18_to_29: u64,
    pub from_30_to_49: u64,
    pub over_50: u64,
    pub unknown: u64,
}

impl AgeHistogram {
    fn add(&mut self, age: Option<u32>) {
        match age {
            None => self.unknown += 1,
            Some(a) if a < 18 => self.under_18 += 1,
            Some(a) if a < 30 => self.from_18_to_29 += 1,
            Some(a) if a < 50 => self.from_30_to_49 += 1,
            Some(_) => self.over_50 += 1,
        }
    }

    fn merge(&mut self, other: &Self) {
        self.under_18 += other.under_18;
        self.from_18_to_29 += other.from_18_to_29;
        self.from_30_to_49 += other.from_30_to_49;
        self.over_50 += other.over_50;
        self.unknown += other.unknown;
    }
}

/// Comparison score bands, in percent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBands {
    pub below_50: u64,
    pub from_50_to_69: u64,
    pub from_70_to_89: u64,
    pub from_90: u64,
    pub unknown: u64,
}

impl ScoreBands {
    fn add(&mut self, score: f64) {
        if score < 50.0 {
            self.below_50 += 1;
        } else if score < 70.0 {
            self.from_50_to_69 += 1;
        } else if score < 90.0 {
            self.from_70_to_89 += 1;
        } else {
            self.from_90 += 1;
        }
    }

    fn merge(&mut self, other: &Self) {
        self.below_50 += other.below_50;
        self.from_50_to_69 += other.from_50_to_69;
        self.from_70_to_89 += other.from_70_to_89;
        self.from_90 += other.from_90;
        self.unknown += other.unknown;
    }
}

/// Running score moments in fixed point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub count: u64,
    /// Sum of scores in thousandths of a percent.
    pub sum_milli: u64,
    /// Sum of squared scores in (thousandths of a percent)^2.
    pub sum_sq_milli: u128,
    pub min_milli: Option<u64>,
    pub max_milli: Option<u64>,
}

impl ScoreSummary {
    fn add(&mut self, score: f64) {
        let milli = to_milli(score);
        self.count += 1;
        self.sum_milli += milli;
        self.sum_sq_milli += u128::from(milli) * u128::from(milli);
        self.min_milli = Some(self.min_milli.map_or(milli, |m| m.min(milli)));
        self.max_milli = Some(self.max_milli.map_or(milli, |m| m.max(milli)));
    }

    fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.sum_milli += other.sum_milli;
        self.sum_sq_milli += other.sum_sq_milli;
        self.min_milli = match (self.min_milli, other.min_milli) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_milli = match (self.max_milli, other.max_milli) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum_milli as f64 / self.count as f64 / SCORE_SCALE)
    }

    /// Population variance of the scores, in percent squared.
    pub fn variance(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum_milli as f64 / n;
        let var = (self.sum_sq_milli as f64 / n - mean * mean).max(0.0);
        Some(var / (SCORE_SCALE * SCORE_SCALE))
    }

    pub fn min(&self) -> Option<f64> {
        self.min_milli.map(|m| m as f64 / SCORE_SCALE)
    }

    pub fn max(&self) -> Option<f64> {
        self.max_milli.map(|m| m as f64 / SCORE_SCALE)
    }
}

fn to_milli(score: f64) -> u64 {
    (score.max(0.0) * SCORE_SCALE).round() as u64
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str, by: u64) {
    *map.entry(key.to_string()).or_insert(0) += by;
}

fn merge_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (key, count) in from {
        bump(into, key, *count);
    }
}

fn top_n(counts: &BTreeMap<String, u64>, n: usize) -> Vec<(&str, u64)> {
    let mut ranked: Vec<(&str, u64)> = counts
        .iter()
        .map(|(name, count)| (name.as_str(), *count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked.truncate(n);
    ranked
}

/// Monoid of per-record statistics.
///
/// `Default` is the identity; [`merge`](Self::merge) is the associative,
/// commutative combine; [`fold`](Self::fold) is merging a single record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateStats {
    pub records_processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub with_image: u64,
    pub without_image: u64,
    pub per_device: BTreeMap<String, u64>,
    pub per_company: BTreeMap<String, u64>,
    pub event_types: BTreeMap<String, u64>,
    pub user_lists: BTreeMap<String, u64>,
    pub per_user: BTreeMap<String, u64>,
    pub per_ip: BTreeMap<String, u64>,
    pub sex: SexBreakdown,
    pub age: AgeHistogram,
    pub score: ScoreSummary,
    pub score_bands: ScoreBands,
    pub hourly: [u64; 24],
    /// Failure counters keyed by [`ErrorKind::as_str`](crate::ErrorKind::as_str).
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl AggregateStats {
    /// Add a single processed record.
    pub fn fold(&mut self, processed: &ProcessedRecord) {
        self.records_processed += 1;

        match &processed.outcome {
            RecordOutcome::Success { image } => {
                self.succeeded += 1;
                if image.is_some() {
                    self.with_image += 1;
                } else {
                    self.without_image += 1;
                }
            }
            other => {
                self.failed += 1;
                if let Some(kind) = other.error_kind() {
                    bump(&mut self.errors_by_kind, kind.as_str(), 1);
                }
                if matches!(other, RecordOutcome::FetchError { .. }) {
                    self.without_image += 1;
                }
            }
        }

        // Demographics only for records that passed decoding and validation.
        let counts_demographics = matches!(
            processed.outcome,
            RecordOutcome::Success { .. } | RecordOutcome::FetchError { .. }
        );
        if !counts_demographics {
            return;
        }
        let Some(record) = &processed.record else {
            return;
        };

        if let Some(device) = &record.device_id {
            bump(&mut self.per_device, device, 1);
        }
        if let Some(company) = &record.company_id {
            bump(&mut self.per_company, company, 1);
        }
        if let Some(event_type) = &record.event_type {
            bump(&mut self.event_types, event_type, 1);
        }
        if let Some(list) = &record.user_list {
            bump(&mut self.user_lists, list, 1);
        }
        if let Some(user) = &record.user_name {
            bump(&mut self.per_user, user, 1);
        }
        if let Some(ip) = &record.ip_address {
            bump(&mut self.per_ip, ip, 1);
        }
        self.sex.add(record.sex);
        self.age.add(record.age);
        match record.score {
            Some(score) => {
                self.score.add(score);
                self.score_bands.add(score);
            }
            None => self.score_bands.unknown += 1,
        }
        if let Some(hour) = record.hour() {
            self.hourly[hour as usize % 24] += 1;
        }
    }

    /// Combine another partial aggregate into this one.
    pub fn merge(&mut self, other: &AggregateStats) {
        self.records_processed += other.records_processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.with_image += other.with_image;
        self.without_image += other.without_image;
        merge_counts(&mut self.per_device, &other.per_device);
        merge_counts(&mut self.per_company, &other.per_company);
        merge_counts(&mut self.event_types, &other.event_types);
        merge_counts(&mut self.user_lists, &other.user_lists);
        merge_counts(&mut self.per_user, &other.per_user);
        merge_counts(&mut self.per_ip, &other.per_ip);
        self.sex.merge(&other.sex);
        self.age.merge(&other.age);
        self.score.merge(&other.score);
        self.score_bands.merge(&other.score_bands);
        for (slot, count) in self.hourly.iter_mut().zip(other.hourly.iter()) {
            *slot += count;
        }
        merge_counts(&mut self.errors_by_kind, &other.errors_by_kind);
    }

    pub fn score_mean(&self) -> Option<f64> {
        self.score.mean()
    }

    pub fn score_variance(&self) -> Option<f64> {
        self.score.variance()
    }

    /// Fraction of processed records that succeeded, in `[0, 1]`.
    pub fn success_rate(&self) -> f64 {
        if self.records_processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.records_processed as f64
        }
    }

    /// The `n` busiest devices, by descending count then name.
    pub fn top_devices(&self, n: usize) -> Vec<(&str, u64)> {
        top_n(&self.per_device, n)
    }

    /// The `n` most frequently recognized users, by descending count then name.
    pub fn top_users(&self, n: usize) -> Vec<(&str, u64)> {
        top_n(&self.per_user, n)
    }

    pub fn unique_users(&self) -> usize {
        self.per_user.len()
    }

    pub fn unique_ips(&self) -> usize {
        self.per_ip.len()
    }
}

/// Thread-safe running aggregate shared by the pipeline.
///
/// Partial aggregates are merged under the lock; readers get a snapshot copy.
#[derive(Debug, Default)]
pub struct AggregateAccumulator {
    inner: Mutex<AggregateStats>,
}

impl AggregateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously committed aggregate (resume).
    pub fn from_snapshot(stats: AggregateStats) -> Self {
        Self {
            inner: Mutex::new(stats),
        }
    }

    pub fn merge(&self, partial: &AggregateStats) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.merge(partial);
    }

    pub fn snapshot(&self) -> AggregateStats {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn records_processed(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, ValidationIssue};
    use crate::types::{ErrorKind, ImageRef};
    use serde_json::json;
    use std::path::PathBuf;

    fn record(device: &str, age: u32, score: f64, ts: &str) -> Record {
        Record::from_value(&json!({
            "timestamp": ts,
            "device_id": device,
            "user_name": "someone",
            "eva_sex": if age % 2 == 0 { "female" } else { "male" },
            "eva_age": age,
            "comp_score": score,
            "company_id": "17",
        }))
        .unwrap()
    }

    fn success(offset: u64, record: Record, with_image: bool) -> ProcessedRecord {
        let image = with_image.then(|| ImageRef {
            key: format!("k{offset}"),
            path: PathBuf::from(format!("/tmp/k{offset}.jpg")),
            bytes: 1024,
        });
        ProcessedRecord {
            offset,
            record: Some(record),
            outcome: RecordOutcome::Success { image },
        }
    }

    fn sample_records() -> Vec<ProcessedRecord> {
        vec![
            success(0, record("gate-01", 16, 95.5, "2024-03-05 08:00:01"), true),
            success(1, record("gate-01", 25, 72.0, "2024-03-05 08:30:00"), false),
            success(2, record("gate-02", 41, 49.9, "2024-03-05 17:10:00"), true),
            ProcessedRecord {
                offset: 3,
                record: Some(record("gate-03", 63, 66.6, "2024-03-05 23:59:59")),
                outcome: RecordOutcome::FetchError {
                    kind: ErrorKind::Timeout,
                    message: "timed out".into(),
                    attempts: 3,
                },
            },
            ProcessedRecord {
                offset: 4,
                record: None,
                outcome: RecordOutcome::ParseError {
                    message: "invalid JSON".into(),
                },
            },
        ]
    }

    #[test]
    fn test_fold_counts() {
        let mut stats = AggregateStats::default();
        for r in &sample_records() {
            stats.fold(r);
        }

        assert_eq!(stats.records_processed, 5);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.with_image, 2);
        assert_eq!(stats.without_image, 2);
        assert_eq!(stats.per_device.get("gate-01"), Some(&2));
        assert_eq!(stats.per_device.get("gate-03"), Some(&1));
        assert_eq!(stats.per_company.get("17"), Some(&4));
        assert_eq!(stats.sex.female, 1);
        assert_eq!(stats.sex.male, 3);
        assert_eq!(stats.age.under_18, 1);
        assert_eq!(stats.age.from_18_to_29, 1);
        assert_eq!(stats.age.from_30_to_49, 1);
        assert_eq!(stats.age.over_50, 1);
        assert_eq!(stats.score_bands.below_50, 1);
        assert_eq!(stats.score_bands.from_50_to_69, 1);
        assert_eq!(stats.score_bands.from_70_to_89, 1);
        assert_eq!(stats.score_bands.from_90, 1);
        assert_eq!(stats.hourly[8], 2);
        assert_eq!(stats.hourly[17], 1);
        assert_eq!(stats.hourly[23], 1);
        assert_eq!(stats.errors_by_kind.get("timeout"), Some(&1));
        assert_eq!(stats.errors_by_kind.get("parse"), Some(&1));
        assert_eq!(stats.score.min(), Some(49.9));
        assert_eq!(stats.score.max(), Some(95.5));
    }

    #[test]
    fn test_merge_is_split_invariant() {
        let records = sample_records();

        let mut whole = AggregateStats::default();
        for r in &records {
            whole.fold(r);
        }

        for split in 0..=records.len() {
            let mut left = AggregateStats::default();
            let mut right = AggregateStats::default();
            for r in &records[..split] {
                left.fold(r);
            }
            for r in &records[split..] {
                right.fold(r);
            }

            let mut lr = left.clone();
            lr.merge(&right);
            let mut rl = right.clone();
            rl.merge(&left);
            assert_eq!(lr, whole, "split at {split}");
            assert_eq!(rl, whole, "split at {split} (reversed)");
        }
    }

    #[test]
    fn test_identity_merge() {
        let mut stats = AggregateStats::default();
        for r in &sample_records() {
            stats.fold(r);
        }
        let before = stats.clone();
        stats.merge(&AggregateStats::default());
        assert_eq!(stats, before);
    }

    #[test]
    fn test_score_moments() {
        let mut stats = AggregateStats::default();
        stats.fold(&success(0, record("d", 30, 80.0, "2024-01-01 00:00:00"), false));
        stats.fold(&success(1, record("d", 30, 90.0, "2024-01-01 00:00:00"), false));
        assert_eq!(stats.score_mean(), Some(85.0));
        let var = stats.score_variance().unwrap();
        assert!((var - 25.0).abs() < 1e-9, "variance {var}");
    }

    #[test]
    fn test_empty_accessors() {
        let stats = AggregateStats::default();
        assert_eq!(stats.score_mean(), None);
        assert_eq!(stats.score_variance(), None);
        assert_eq!(stats.success_rate(), 0.0);
        assert!(stats.top_devices(3).is_empty());
    }

    #[test]
    fn test_users_and_ips() {
        let event = |user: &str, ip: Option<&str>| {
            let mut value = json!({
                "timestamp": "2024-03-05 10:00:00",
                "device_id": "gate-01",
                "user_name": user,
            });
            if let Some(ip) = ip {
                value["IP"] = json!(ip);
            }
            Record::from_value(&value).unwrap()
        };
        let records = vec![
            success(0, event("petrov", Some("10.0.0.1")), false),
            success(1, event("ivanova", Some("10.0.0.2")), false),
            success(2, event("petrov", Some("10.0.0.1")), false),
            success(3, event("sidorov", None), false),
            ProcessedRecord {
                offset: 4,
                record: Some(event("rejected", Some("10.0.0.9"))),
                outcome: RecordOutcome::ValidationError {
                    issues: vec![ValidationIssue::ScoreOutOfRange { score: 140.0 }],
                },
            },
        ];

        let mut stats = AggregateStats::default();
        for r in &records {
            stats.fold(r);
        }
        assert_eq!(stats.unique_users(), 3);
        assert_eq!(stats.unique_ips(), 2);
        assert_eq!(stats.per_ip.get("10.0.0.1"), Some(&2));
        assert_eq!(stats.top_users(2), vec![("petrov", 2), ("ivanova", 1)]);

        let mut left = AggregateStats::default();
        let mut right = AggregateStats::default();
        for r in &records[..2] {
            left.fold(r);
        }
        for r in &records[2..] {
            right.fold(r);
        }
        right.merge(&left);
        assert_eq!(right, stats);
    }

    #[test]
    fn test_score_squares_do_not_overflow() {
        let mut summary = ScoreSummary::default();
        summary.add(100.0);
        summary.sum_sq_milli = u128::from(u64::MAX);
        summary.add(100.0);
        assert_eq!(summary.sum_sq_milli, u128::from(u64::MAX) + 10_000_000_000);
        assert_eq!(summary.count, 2);
    }

    #[test]
    fn test_top_devices_ordering() {
        let mut stats = AggregateStats::default();
        for r in &sample_records() {
            stats.fold(r);
        }
        let top = stats.top_devices(2);
        assert_eq!(top, vec![("gate-01", 2), ("gate-02", 1)]);
    }

    #[test]
    fn test_accumulator_merge_and_snapshot() {
        let mut partial = AggregateStats::default();
        for r in &sample_records() {
            partial.fold(r);
        }

        let acc = AggregateAccumulator::from_snapshot(partial.clone());
        acc.merge(&partial);
        assert_eq!(acc.records_processed(), 10);
        assert_eq!(acc.snapshot().per_device.get("gate-01"), Some(&4));
    }

    #[test]
    fn test_serde_round_trip_preserves_scores() {
        let mut stats = AggregateStats::default();
        for r in &sample_records() {
            stats.fold(r);
        }
        let json = serde_json::to_string(&stats).unwrap();
        let back: AggregateStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats);
    }
}
