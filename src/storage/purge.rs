//! Purge schedulers (spec §4.10, C10): an hours-based day-retention sweep
//! that closes containers, and a per-kind days-based sweep that deletes
//! on-disk directories, plus a disk-usage-triggered oldest-first sweep.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};

use crate::storage::container::ContainerRegistry;

pub const DATE_FORMAT: &str = "%Y%m%d";

pub fn today() -> String {
    Utc::now().format(DATE_FORMAT).to_string()
}

/// The set of date strings (today and the `keep_hours/24 - 1` preceding
/// days) that must stay open.
pub fn keep_set(keep_hours: u64) -> HashSet<String> {
    let days = (keep_hours / 24).max(1);
    let today = Utc::now().date_naive();
    (0..days)
        .map(|offset| {
            (today - ChronoDuration::days(offset as i64))
                .format(DATE_FORMAT)
                .to_string()
        })
        .collect()
}

/// Every hour: compute the keep set and close every container (reader and
/// writer alike, since they share one registry) whose date falls outside it.
pub async fn run_hours_based(registry: Arc<ContainerRegistry>, keep_hours: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    loop {
        interval.tick().await;
        let keep = keep_set(keep_hours);
        registry.purge_not_in(&keep);
        log::info!("hours-based purge ran, keeping {} day(s)", keep.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionKind {
    Profile,
    XLog,
    Summary,
    Counter,
    RealtimeCounter,
    DailyText,
}

impl RetentionKind {
    /// The top-level sub-path under `<data_dir>/<date>/` this kind owns.
    /// `Counter` removes the whole date directory (spec §4.10: "the
    /// longest retention and acts as the floor").
    fn relative_path(&self) -> Option<&'static str> {
        match self {
            RetentionKind::Profile => Some("xlog/xlog_prof"),
            RetentionKind::XLog => Some("xlog"),
            RetentionKind::Summary => Some("summary"),
            RetentionKind::Counter => None,
            RetentionKind::RealtimeCounter => Some("counter"),
            RetentionKind::DailyText => Some("text"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionRule {
    pub kind: RetentionKind,
    pub keep_days: u64,
}

/// Once at startup and every minute: for each `(kind, keep_days)` rule,
/// remove the kind-specific path(s) under every date directory older than
/// `today - keep_days` (never touching today). `Counter`'s rule removes
/// the entire date directory.
pub fn sweep_days_based(data_dir: &Path, rules: &[RetentionRule]) -> std::io::Result<()> {
    let today = Utc::now().date_naive();
    let mut entries: Vec<(NaiveDate, std::path::PathBuf)> = Vec::new();
    if !data_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(data_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Ok(date) = NaiveDate::parse_from_str(&name, DATE_FORMAT) {
            entries.push((date, entry.path()));
        }
    }
    entries.sort_by_key(|(date, _)| *date);

    for rule in rules {
        let cutoff = today - ChronoDuration::days(rule.keep_days as i64);
        for (date, path) in &entries {
            if *date >= today || *date >= cutoff {
                continue;
            }
            match rule.kind.relative_path() {
                Some(rel) => {
                    let target = path.join(rel);
                    if target.exists() {
                        log::info!("purging {:?} ({:?}, keep_days={})", target, rule.kind, rule.keep_days);
                        std::fs::remove_dir_all(&target)?;
                    }
                }
                None => {
                    log::info!("purging entire date dir {:?} ({:?} floor)", path, rule.kind);
                    std::fs::remove_dir_all(path)?;
                }
            }
        }
    }
    Ok(())
}

pub async fn run_days_based(data_dir: std::path::PathBuf, rules: Vec<RetentionRule>) {
    if let Err(e) = sweep_days_based(&data_dir, &rules) {
        log::error!("days-based purge failed at startup: {e}");
    }
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if let Err(e) = sweep_days_based(&data_dir, &rules) {
            log::error!("days-based purge failed: {e}");
        }
    }
}

/// Remove oldest date directories (by name, which sorts lexicographically
/// the same as chronologically for `YYYYMMDD`) until usage drops under
/// `threshold_pct` of the filesystem `data_dir` lives on, or there's
/// nothing left to remove. `disk_usage_fn` is injected for testability.
pub fn sweep_disk_usage(
    data_dir: &Path,
    threshold_pct: u8,
    mut disk_usage_fn: impl FnMut(&Path) -> std::io::Result<u8>,
) -> std::io::Result<()> {
    loop {
        let usage = disk_usage_fn(data_dir)?;
        if usage < threshold_pct {
            return Ok(());
        }
        let mut dates: Vec<std::path::PathBuf> = std::fs::read_dir(data_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        dates.sort();
        match dates.first() {
            Some(oldest) => {
                log::warn!("disk usage {usage}% >= {threshold_pct}%, removing {oldest:?}");
                std::fs::remove_dir_all(oldest)?;
            }
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keep_set_includes_today_and_preceding_days() {
        let set = keep_set(72);
        assert_eq!(set.len(), 3);
        assert!(set.contains(&today()));
    }

    #[test]
    fn sweep_days_based_removes_only_kind_path_for_old_dates() {
        let dir = tempdir().unwrap();
        let old_date = (Utc::now().date_naive() - ChronoDuration::days(5))
            .format(DATE_FORMAT)
            .to_string();
        let day_dir = dir.path().join(&old_date);
        std::fs::create_dir_all(day_dir.join("xlog")).unwrap();
        std::fs::create_dir_all(day_dir.join("summary")).unwrap();

        sweep_days_based(
            dir.path(),
            &[RetentionRule {
                kind: RetentionKind::XLog,
                keep_days: 0,
            }],
        )
        .unwrap();

        assert!(!day_dir.join("xlog").exists());
        assert!(day_dir.join("summary").exists());
    }

    #[test]
    fn counter_rule_removes_whole_date_dir() {
        let dir = tempdir().unwrap();
        let old_date = (Utc::now().date_naive() - ChronoDuration::days(5))
            .format(DATE_FORMAT)
            .to_string();
        let day_dir = dir.path().join(&old_date);
        std::fs::create_dir_all(day_dir.join("xlog")).unwrap();

        sweep_days_based(
            dir.path(),
            &[RetentionRule {
                kind: RetentionKind::Counter,
                keep_days: 0,
            }],
        )
        .unwrap();

        assert!(!day_dir.exists());
    }

    #[test]
    fn disk_usage_sweep_stops_under_threshold() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("20260101")).unwrap();
        std::fs::create_dir_all(dir.path().join("20260102")).unwrap();
        let mut calls = 0;
        sweep_disk_usage(dir.path(), 80, |_| {
            calls += 1;
            Ok(if calls == 1 { 90 } else { 50 })
        })
        .unwrap();
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(remaining.len(), 1);
    }
}
