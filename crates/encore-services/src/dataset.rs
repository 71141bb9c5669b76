//! Dataset query engine — scans the play-count dataset for one query.
//!
//! Line format: `musicId,artistId[,artistId...],userId,genre,plays`. Artist
//! fields are the run after the music id that start with `A`; the last field
//! is the play count. The file is memory-mapped and parsed once per worker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use encore_core::{Query, QueryResult};

use crate::cache::{Category, ProfileFragment, TopList, TOP_N};

/// One dataset line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub music_id: String,
    pub artists: Vec<String>,
    pub user_id: String,
    pub genre: String,
    pub plays: u64,
}

impl PlayRecord {
    /// Parse one CSV line. Returns None for blank or malformed lines.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() < 4 || fields[0].is_empty() {
            return None;
        }
        let n = fields.len();
        let plays = fields[n - 1].parse().ok()?;
        let artists = &fields[1..n - 3];
        if !artists.iter().all(|a| a.starts_with('A')) {
            return None;
        }
        Some(Self {
            music_id: fields[0].to_string(),
            artists: artists.iter().map(|a| a.to_string()).collect(),
            user_id: fields[n - 3].to_string(),
            genre: fields[n - 2].to_string(),
            plays,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("dataset {0} unavailable: {1}")]
    Unavailable(PathBuf, std::io::Error),
}

/// Parsed dataset held in memory.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: Vec<PlayRecord>,
}

impl Dataset {
    /// Map and parse the dataset at `path`.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let file =
            fs::File::open(path).map_err(|e| DatasetError::Unavailable(path.to_path_buf(), e))?;
        let len = file
            .metadata()
            .map_err(|e| DatasetError::Unavailable(path.to_path_buf(), e))?
            .len();
        if len == 0 {
            return Ok(Self::default());
        }

        // Safety: mapped read-only and never mutated; the dataset is fixed input.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| DatasetError::Unavailable(path.to_path_buf(), e))?
        };
        let dataset = Self::from_csv(&String::from_utf8_lossy(&mmap));
        tracing::info!(
            path = %path.display(),
            records = dataset.len(),
            "dataset loaded"
        );
        Ok(dataset)
    }

    pub fn from_csv(text: &str) -> Self {
        let mut records = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match PlayRecord::parse(line) {
                Some(r) => records.push(r),
                None => tracing::debug!(line = lineno + 1, "skipping malformed dataset line"),
            }
        }
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn user_records(&self, user_id: &str) -> Vec<PlayRecord> {
        self.records
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Outcome of running one query against the dataset.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: QueryResult,
    /// Profile fragment to cache, for user-keyed queries.
    pub fragment: Option<ProfileFragment>,
}

/// Executes one query kind and produces its result.
pub trait QueryEngine: Send + Sync {
    fn execute(&self, query: &Query) -> Execution;
}

impl QueryEngine for Dataset {
    fn execute(&self, query: &Query) -> Execution {
        match query {
            Query::TimesPlayed { music_id } => {
                let plays = self
                    .records
                    .iter()
                    .filter(|r| &r.music_id == music_id)
                    .map(|r| r.plays)
                    .sum();
                Execution {
                    result: QueryResult::TimesPlayed(plays),
                    fragment: None,
                }
            }
            Query::TimesPlayedByUser { music_id, user_id } => {
                let list = TopList::from_sources(Category::AllMusic, self.user_records(user_id));
                Execution {
                    result: QueryResult::TimesPlayedByUser(list.plays_of_music(music_id)),
                    fragment: Some(ProfileFragment::new(user_id, list)),
                }
            }
            Query::TopThreeMusicByUser { user_id } => {
                let list = TopList::from_sources(Category::AllMusic, self.user_records(user_id));
                Execution {
                    result: QueryResult::TopThreeMusicByUser(list.ids()),
                    fragment: Some(ProfileFragment::new(user_id, list)),
                }
            }
            Query::TopArtistsByUserGenre { user_id, genre } => {
                let sources = self
                    .records
                    .iter()
                    .filter(|r| &r.user_id == user_id && &r.genre == genre)
                    .cloned()
                    .collect();
                let list = TopList::from_sources(Category::Genre(genre.clone()), sources);
                Execution {
                    result: QueryResult::TopArtistsByUserGenre(list.ids()),
                    fragment: Some(ProfileFragment::new(user_id, list)),
                }
            }
        }
    }
}

/// Sum plays per id and order descending; ties keep first-seen order.
pub fn rank<'a>(plays: impl IntoIterator<Item = (&'a str, u64)>) -> Vec<(String, u64)> {
    let mut totals: Vec<(String, u64)> = Vec::new();
    let mut index: HashMap<&'a str, usize> = HashMap::new();
    for (id, n) in plays {
        match index.get(id) {
            Some(&i) => totals[i].1 += n,
            None => {
                index.insert(id, totals.len());
                totals.push((id.to_string(), n));
            }
        }
    }
    // stable sort keeps first-seen order among equal counts
    totals.sort_by(|a, b| b.1.cmp(&a.1));
    totals.truncate(TOP_N);
    totals
}
