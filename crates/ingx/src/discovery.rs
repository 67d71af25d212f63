//! 🔍 Work discovery: "what haven't we ingested yet?"
//!
//! Path mode lists a directory, keeps names that match a glob, and diffs them against
//! the data-file markers already in the store: a file is new work when the store has
//! never seen it, or has only seen an older modification time. Identifier mode skips
//! all of that; the configured id list *is* the work list.
//!
//! 🕰️ Oldest first. Replays lean toward chronological completeness, even though workers
//! finish in whatever order they finish.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, trace};

use crate::common::{DataFileRecord, WorkItem, file_name_of};
use crate::template::handlers::parse_epoch;

/// 📄 A file that might be work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    /// Milliseconds since the epoch. Whole seconds would hide a rewrite that lands in
    /// the same second as the last ingest.
    pub mtime: i64,
}

impl Candidate {
    pub fn new(path: impl Into<PathBuf>, mtime: i64) -> Self {
        Self {
            path: path.into(),
            mtime,
        }
    }
}

/// 🪟 Which candidates are even eligible. An unset mask means no name filtering and no
/// time window (there's no time to window on).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryFilter {
    pub file_mask: Option<String>,
    pub first_epoch: Option<i64>,
    pub last_epoch: Option<i64>,
}

impl DiscoveryFilter {
    fn admits(&self, candidate: &Candidate) -> bool {
        let Some(mask) = &self.file_mask else {
            return true;
        };
        let name = file_name_of(&candidate.path);
        let Ok(stamp) = parse_epoch(&name, mask) else {
            trace!("🙈 '{name}' does not parse under '{mask}', ignoring it");
            return false;
        };
        self.first_epoch.is_none_or(|first| stamp >= first)
            && self.last_epoch.is_none_or(|last| stamp <= last)
    }
}

/// Known records by path, keeping the newest mtime when a path shows up twice.
pub fn known_records_index(records: &[DataFileRecord]) -> HashMap<String, i64> {
    let mut known: HashMap<String, i64> = HashMap::with_capacity(records.len());
    for record in records {
        known
            .entry(record.url.clone())
            .and_modify(|mtime| *mtime = (*mtime).max(record.mtime))
            .or_insert(record.mtime);
    }
    known
}

/// 🎯 New or updated candidates, oldest first. Ties break on path so runs are repeatable.
pub fn discover(
    candidates: Vec<Candidate>,
    known: &HashMap<String, i64>,
    filter: &DiscoveryFilter,
) -> Vec<Candidate> {
    let mut work: Vec<Candidate> = candidates
        .into_iter()
        .filter(|candidate| filter.admits(candidate))
        .filter(|candidate| {
            match known.get(&candidate.path.display().to_string()) {
                None => true,
                Some(&recorded) => candidate.mtime > recorded,
            }
        })
        .collect();
    work.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path)));
    work
}

/// Identifier mode: the list is the work, in the order it was configured.
pub fn discover_identifiers(record_ids: &[String], ingest_document_id: &str) -> Vec<WorkItem> {
    record_ids
        .iter()
        .map(|id| WorkItem::from_identifier(id.clone(), ingest_document_id))
        .collect()
}

/// `*` and `?` globbing over file names, anchored at both ends.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expression = String::with_capacity(pattern.len() + 8);
    expression.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expression.push_str(".*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }
    expression.push('$');
    Regex::new(&expression).context(format!("💀 '{pattern}' is not a usable file pattern"))
}

/// 📂 Regular files in `dir` whose names match `pattern`, with their mtimes. Not recursive.
pub async fn list_candidates(dir: &Path, pattern: &str) -> Result<Vec<Candidate>> {
    let matcher = glob_to_regex(pattern)?;
    let mut entries = tokio::fs::read_dir(dir).await.context(format!(
        "💀 Could not list input directory '{}'. Does it exist? Can we read it?",
        dir.display()
    ))?;

    let mut candidates = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        if !matcher.is_match(&file_name_of(&path)) {
            continue;
        }
        let mtime = epoch_millis(metadata.modified()?);
        candidates.push(Candidate { path, mtime });
    }
    debug!(
        "📂 {} candidate file(s) in '{}' match '{pattern}'",
        candidates.len(),
        dir.display()
    );
    Ok(candidates)
}

fn epoch_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|since| i64::try_from(since.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn known(entries: &[(&str, i64)]) -> HashMap<String, i64> {
        entries
            .iter()
            .map(|(path, mtime)| (path.to_string(), *mtime))
            .collect()
    }

    #[test]
    fn the_one_where_only_b_is_new() {
        let candidates = vec![Candidate::new("a.dat", 10), Candidate::new("b.dat", 20)];
        let work = discover(candidates, &known(&[("a.dat", 10)]), &DiscoveryFilter::default());
        assert_eq!(work, vec![Candidate::new("b.dat", 20)]);
    }

    #[test]
    fn the_one_where_the_second_run_finds_nothing() {
        let candidates = vec![Candidate::new("a.dat", 10), Candidate::new("b.dat", 20)];
        let first = discover(candidates.clone(), &HashMap::new(), &DiscoveryFilter::default());
        assert_eq!(first.len(), 2);

        // -- the store now knows what the first run recorded
        let recorded: HashMap<String, i64> = first
            .iter()
            .map(|c| (c.path.display().to_string(), c.mtime))
            .collect();
        assert!(discover(candidates, &recorded, &DiscoveryFilter::default()).is_empty());
    }

    #[test]
    fn the_one_where_newer_wins_exactly_once() {
        let touched = vec![Candidate::new("a.dat", 15)];
        let work = discover(touched.clone(), &known(&[("a.dat", 10)]), &DiscoveryFilter::default());
        assert_eq!(work.len(), 1);
        let again = discover(touched, &known(&[("a.dat", 15)]), &DiscoveryFilter::default());
        assert!(again.is_empty());
    }

    #[test]
    fn the_one_where_oldest_goes_first() {
        let candidates = vec![
            Candidate::new("c.dat", 30),
            Candidate::new("b.dat", 10),
            Candidate::new("a.dat", 10),
        ];
        let work = discover(candidates, &HashMap::new(), &DiscoveryFilter::default());
        let names: Vec<_> = work.iter().map(|c| c.path.display().to_string()).collect();
        assert_eq!(names, vec!["a.dat", "b.dat", "c.dat"]);
    }

    #[test]
    fn the_one_where_strangers_in_the_directory_are_ignored_quietly() {
        let filter = DiscoveryFilter {
            file_mask: Some("%Y%m%d_%H%M.json".into()),
            ..DiscoveryFilter::default()
        };
        let candidates = vec![
            Candidate::new("/d/20231019_1200.json", 1),
            Candidate::new("/d/README.md", 2),
            Candidate::new("/d/20231019_1300.json.partial", 3),
        ];
        let work = discover(candidates, &HashMap::new(), &filter);
        assert_eq!(work, vec![Candidate::new("/d/20231019_1200.json", 1)]);
    }

    #[test]
    fn the_one_where_the_window_closes() {
        let filter = DiscoveryFilter {
            file_mask: Some("%Y%m%d_%H%M.json".into()),
            first_epoch: Some(1697716800), // 2023-10-19 12:00
            last_epoch: Some(1697720400),  // 2023-10-19 13:00
        };
        let candidates = vec![
            Candidate::new("20231019_1100.json", 1),
            Candidate::new("20231019_1200.json", 2),
            Candidate::new("20231019_1300.json", 3),
            Candidate::new("20231019_1400.json", 4),
        ];
        let work = discover(candidates, &HashMap::new(), &filter);
        assert_eq!(work.len(), 2);
    }

    #[test]
    fn the_one_where_markers_collapse_to_the_newest() {
        use crate::job::{BuilderType, IngestDocument};
        let document = IngestDocument {
            id: "MD:1".into(),
            builder_type: BuilderType::NestedRows,
            subset: "M".into(),
            template: serde_json::json!({"id": "x"}),
            params: Default::default(),
            optional_fields: vec![],
            record_ids: vec![],
            input_dir: None,
            file_pattern: None,
            file_mask: None,
        };
        let records = vec![
            DataFileRecord::new(Path::new("/d/a.json"), 10, &document),
            DataFileRecord::new(Path::new("/d/a.json"), 30, &document),
        ];
        assert_eq!(known_records_index(&records)["/d/a.json"], 30);
    }

    #[test]
    fn the_one_where_globs_are_anchored() {
        let matcher = glob_to_regex("*.json").unwrap();
        assert!(matcher.is_match("obs.json"));
        assert!(!matcher.is_match("obs.json.gz"));
        assert!(glob_to_regex("obs_??.ndjson").unwrap().is_match("obs_01.ndjson"));
        assert!(!glob_to_regex("a+b").unwrap().is_match("aab"));
    }

    #[test]
    fn the_one_where_identifiers_skip_the_filesystem() {
        let ids = vec!["DD:2".to_string(), "DD:1".to_string()];
        let work = discover_identifiers(&ids, "MD:1");
        assert_eq!(work[0].label(), "DD:2");
        assert_eq!(work[1].label(), "DD:1");
    }

    #[tokio::test]
    async fn the_one_where_a_real_directory_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("two.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        std::fs::create_dir(dir.path().join("nested.json")).unwrap();

        let mut found = list_candidates(dir.path(), "*.json").await.unwrap();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(found.len(), 2);
        assert!(found[0].path.ends_with("one.json"));
        assert!(found[0].mtime > 0);
    }

    #[tokio::test]
    async fn the_one_where_a_rewrite_inside_the_same_second_still_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obs.json");
        std::fs::write(&path, b"{}").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        let ingested_at = UNIX_EPOCH + Duration::from_millis(1_700_000_000_100);
        file.set_modified(ingested_at).unwrap();

        let first = list_candidates(dir.path(), "*.json").await.unwrap();
        assert_eq!(first[0].mtime, 1_700_000_000_100);
        let url = path.display().to_string();
        let recorded = known(&[(url.as_str(), first[0].mtime)]);
        assert!(discover(first, &recorded, &DiscoveryFilter::default()).is_empty());

        // -- rewritten 400ms later, same wall-clock second
        file.set_modified(ingested_at + Duration::from_millis(400)).unwrap();
        let second = list_candidates(dir.path(), "*.json").await.unwrap();
        let work = discover(second, &recorded, &DiscoveryFilter::default());
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].mtime, 1_700_000_000_500);
    }
}
