//!
//! src/collector.rs  Andrew Belles  Oct 18th, 2025
//!
//! Accumulates scraped records across scroll passes and tabs, keeping the
//! first occurrence of every song
//!

use std::collections::HashSet;

use tracing::debug;

use crate::types::SongRecord;

#[derive(Debug, Default)]
pub struct SongCollector {
    records: Vec<SongRecord>,
    seen: HashSet<String>
}

impl SongCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers one record. Returns true if it was kept; repeats and records
    /// with neither title nor id are dropped, never merged.
    pub fn add(&mut self, mut record: SongRecord) -> bool {
        record.normalize();
        if !record.is_keepable() {
            debug!(url = %record.url, "collector.drop.untitled");
            return false;
        }
        if let Some(key) = record.dedup_key() {
            if !self.seen.insert(key.to_string()) {
                return false;
            }
        }
        record.index = self.records.len() + 1;
        self.records.push(record);
        true
    }

    /// Number of records kept from the batch
    pub fn extend<I: IntoIterator<Item = SongRecord>>(&mut self, records: I) -> usize {
        records.into_iter().map(|r| self.add(r)).filter(|kept| *kept).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[SongRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [SongRecord] {
        &mut self.records
    }

    /// Drops records failing `keep` and renumbers the survivors
    pub fn retain<F: FnMut(&SongRecord) -> bool>(&mut self, keep: F) {
        self.records.retain(keep);
        for (i, record) in self.records.iter_mut().enumerate() {
            record.index = i + 1;
        }
    }

    pub fn into_records(self) -> Vec<SongRecord> {
        self.records
    }
}

/// Records of `fresh` whose url did not appear in `previous`
pub fn diff_by_url<'a>(previous: &[SongRecord], fresh: &'a [SongRecord]) -> Vec<&'a SongRecord> {
    let known: HashSet<&str> = previous.iter()
        .map(|s| s.url.as_str())
        .filter(|u| !u.is_empty())
        .collect();
    fresh.iter()
        .filter(|s| !s.url.is_empty() && !known.contains(s.url.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(id: &str, title: &str) -> SongRecord {
        SongRecord {
            id: id.to_string(),
            title: title.to_string(),
            url: if id.is_empty() { String::new() } else { format!("https://suno.com/song/{id}") },
            ..Default::default()
        }
    }

    #[test]
    fn repeats_are_dropped_not_merged() {
        let mut collector = SongCollector::new();
        assert!(collector.add(song("a", "First")));
        let mut repeat = song("a", "Changed");
        repeat.lyrics = "new lyrics".into();
        assert!(!collector.add(repeat));
        assert!(collector.add(song("b", "Second")));

        let records = collector.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].title, "First");
        assert!(records[0].lyrics.is_empty());
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn untitled_records_without_id_are_never_kept() {
        let mut collector = SongCollector::new();
        assert!(!collector.add(song("", "  ")));
        assert!(collector.add(song("c", "")));
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn ids_stay_unique_across_batches() {
        let mut collector = SongCollector::new();
        let kept = collector.extend(vec![song("a", "A"), song("b", "B"), song("a", "A")]);
        assert_eq!(kept, 2);
        let kept = collector.extend(vec![song("b", "B"), song("c", "C")]);
        assert_eq!(kept, 1);

        let mut ids: Vec<_> = collector.records().iter().map(|r| r.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), collector.len());
    }

    #[test]
    fn retain_renumbers() {
        let mut collector = SongCollector::new();
        collector.extend(vec![song("a", "A"), song("b", "B"), song("c", "C")]);
        collector.retain(|r| r.id != "a");
        let indexes: Vec<_> = collector.records().iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[test]
    fn diff_reports_unseen_urls() {
        let previous = vec![song("a", "A"), song("b", "B")];
        let fresh = vec![song("b", "B"), song("c", "C"), song("", "no url")];
        let new: Vec<_> = diff_by_url(&previous, &fresh).iter().map(|s| s.id.as_str()).collect();
        assert_eq!(new, vec!["c"]);
    }
}
