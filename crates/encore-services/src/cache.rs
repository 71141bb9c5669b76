//! Result cache — per-user profiles of previously computed top-N results.
//!
//! user → category → ranked top-N list plus the source records it was ranked
//! from. A list is replaced wholesale on recomputation, never merged.
//!
//! Bounds: each profile keeps at most `max_categories_per_user` categories in
//! LRU order; the cache keeps at most `max_users` profiles and evicts the
//! least recently touched one. Profiles live in a `DashMap`, so a lookup or
//! store holds only that entry's shard lock.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;

use encore_core::{Query, QueryResult};

use crate::dataset::{rank, PlayRecord};

/// Length of every cached ranking.
pub const TOP_N: usize = 3;

/// What a cached ranking ranks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    /// Top artists of the user within one genre.
    Genre(String),
    /// Top music of the user across every genre. Its sources are the user's
    /// complete record set.
    AllMusic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedEntry {
    pub id: String,
    pub plays: u64,
}

/// A ranked top-N list with the records that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopList {
    pub category: Category,
    pub ranking: Vec<RankedEntry>,
    pub sources: Vec<PlayRecord>,
}

impl TopList {
    /// Rank `sources` for `category`. Also the rebuild path for a list whose
    /// ranking was dropped: sources fully determine it.
    pub fn from_sources(category: Category, sources: Vec<PlayRecord>) -> Self {
        let ranked = match &category {
            Category::Genre(_) => rank(
                sources
                    .iter()
                    .flat_map(|r| r.artists.iter().map(move |a| (a.as_str(), r.plays))),
            ),
            Category::AllMusic => rank(sources.iter().map(|r| (r.music_id.as_str(), r.plays))),
        };
        Self {
            category,
            ranking: ranked
                .into_iter()
                .map(|(id, plays)| RankedEntry { id, plays })
                .collect(),
            sources,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.ranking.iter().map(|e| e.id.clone()).collect()
    }

    /// Total plays of `music_id` across the sources.
    pub fn plays_of_music(&self, music_id: &str) -> u64 {
        self.sources
            .iter()
            .filter(|r| r.music_id == music_id)
            .map(|r| r.plays)
            .sum()
    }
}

/// A freshly computed list to store under one user.
#[derive(Debug, Clone)]
pub struct ProfileFragment {
    pub user_id: String,
    pub list: TopList,
}

impl ProfileFragment {
    pub fn new(user_id: &str, list: TopList) -> Self {
        Self {
            user_id: user_id.to_string(),
            list,
        }
    }
}

/// Cache entry for one user.
pub struct UserProfile {
    categories: LruCache<Category, TopList>,
    last_touched: u64,
}

impl UserProfile {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            categories: LruCache::new(capacity),
            last_touched: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub users: usize,
    pub evicted_users: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result for `query` derived from a list of the matching category.
fn answer(query: &Query, list: &TopList) -> Option<QueryResult> {
    match query {
        Query::TimesPlayed { .. } => None,
        Query::TimesPlayedByUser { music_id, .. } => {
            Some(QueryResult::TimesPlayedByUser(list.plays_of_music(music_id)))
        }
        Query::TopThreeMusicByUser { .. } => Some(QueryResult::TopThreeMusicByUser(list.ids())),
        Query::TopArtistsByUserGenre { .. } => {
            Some(QueryResult::TopArtistsByUserGenre(list.ids()))
        }
    }
}

pub struct ResultCache {
    profiles: DashMap<String, UserProfile>,
    max_users: usize,
    max_categories: NonZeroUsize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evicted_users: AtomicU64,
}

impl ResultCache {
    /// Zero capacities are raised to one.
    pub fn new(max_users: usize, max_categories_per_user: usize) -> Self {
        Self {
            profiles: DashMap::new(),
            max_users: max_users.max(1),
            max_categories: NonZeroUsize::new(max_categories_per_user).unwrap_or(NonZeroUsize::MIN),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted_users: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Answer `query` from a cached list if one can satisfy it.
    ///
    /// Not user-keyed queries are never cached and are not counted as misses.
    pub fn lookup(&self, query: &Query) -> Option<QueryResult> {
        let (user_id, category) = match query {
            Query::TimesPlayed { .. } => return None,
            Query::TimesPlayedByUser { user_id, .. } | Query::TopThreeMusicByUser { user_id } => {
                (user_id, Category::AllMusic)
            }
            Query::TopArtistsByUserGenre { user_id, genre } => {
                (user_id, Category::Genre(genre.clone()))
            }
        };

        let found = self.profiles.get_mut(user_id).and_then(|mut profile| {
            profile.last_touched = self.tick();
            profile
                .categories
                .get(&category)
                .and_then(|list| answer(query, list))
        });

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Store a fragment, replacing any list for the same user and category.
    pub fn store(&self, fragment: ProfileFragment) {
        let ProfileFragment { user_id, list } = fragment;
        let touched = self.tick();
        {
            let mut profile = self
                .profiles
                .entry(user_id.clone())
                .or_insert_with(|| UserProfile::new(self.max_categories));
            profile.last_touched = touched;
            let category = list.category.clone();
            if let Some((evicted, _)) = profile.categories.push(category.clone(), list) {
                if evicted != category {
                    tracing::debug!(user = %user_id, ?evicted, "category evicted from profile");
                }
            }
        }
        // entry guard dropped above; iterating while holding it would deadlock
        while self.profiles.len() > self.max_users {
            if !self.evict_oldest_except(&user_id) {
                break;
            }
        }
    }

    fn evict_oldest_except(&self, keep: &str) -> bool {
        let oldest = self
            .profiles
            .iter()
            .filter(|e| e.key() != keep)
            .min_by_key(|e| e.value().last_touched)
            .map(|e| e.key().clone());
        match oldest {
            Some(user) => {
                self.profiles.remove(&user);
                self.evicted_users.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(user = %user, "user profile evicted");
                true
            }
            None => false,
        }
    }

    /// Categories currently cached for `user_id`.
    pub fn categories_of(&self, user_id: &str) -> usize {
        self.profiles.get(user_id).map(|p| p.len()).unwrap_or(0)
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.profiles.contains_key(user_id)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            users: self.profiles.len(),
            evicted_users: self.evicted_users.load(Ordering::Relaxed),
        }
    }
}
