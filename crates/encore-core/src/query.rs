//! Query grammar — the four query kinds, their arguments and result shapes.
//!
//! External input format: `methodName(arg1,arg2,...)`. Arity is strict per
//! method; any malformed input is a `ProtocolError` and never reaches a worker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Well-known method names.
pub mod methods {
    pub const TIMES_PLAYED: &str = "getTimesPlayed";
    pub const TIMES_PLAYED_BY_USER: &str = "getTimesPlayedByUser";
    pub const TOP_THREE_MUSIC_BY_USER: &str = "getTopThreeMusicByUser";
    pub const TOP_ARTISTS_BY_USER_GENRE: &str = "getTopArtistsByUserGenre";
}

// ── Kinds ─────────────────────────────────────────────────────────────────────

/// Discriminant of a `Query`, used to key per-kind statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    TimesPlayed,
    TimesPlayedByUser,
    TopThreeMusicByUser,
    TopArtistsByUserGenre,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [
        QueryKind::TimesPlayed,
        QueryKind::TimesPlayedByUser,
        QueryKind::TopThreeMusicByUser,
        QueryKind::TopArtistsByUserGenre,
    ];

    pub fn method(self) -> &'static str {
        match self {
            QueryKind::TimesPlayed => methods::TIMES_PLAYED,
            QueryKind::TimesPlayedByUser => methods::TIMES_PLAYED_BY_USER,
            QueryKind::TopThreeMusicByUser => methods::TOP_THREE_MUSIC_BY_USER,
            QueryKind::TopArtistsByUserGenre => methods::TOP_ARTISTS_BY_USER_GENRE,
        }
    }

    pub fn arity(self) -> usize {
        match self {
            QueryKind::TimesPlayed | QueryKind::TopThreeMusicByUser => 1,
            QueryKind::TimesPlayedByUser | QueryKind::TopArtistsByUserGenre => 2,
        }
    }

    pub fn from_method(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.method() == name)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

// ── Queries ───────────────────────────────────────────────────────────────────

/// A parsed query. Each variant carries its own arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    TimesPlayed { music_id: String },
    TimesPlayedByUser { music_id: String, user_id: String },
    TopThreeMusicByUser { user_id: String },
    TopArtistsByUserGenre { user_id: String, genre: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed query {0:?}: expected methodName(arg,...)")]
    Malformed(String),
    #[error("unknown query method {0:?}")]
    UnknownMethod(String),
    #[error("{method} takes {expected} argument(s), got {found}")]
    Arity {
        method: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{method}: argument {position} is empty")]
    EmptyArgument { method: &'static str, position: usize },
}

impl Query {
    /// Parse `methodName(arg1,arg2,...)`. Whitespace around the method and
    /// each argument is ignored.
    pub fn parse(input: &str) -> Result<Self, ProtocolError> {
        let input = input.trim();
        let malformed = || ProtocolError::Malformed(input.to_string());

        let (method, rest) = input.split_once('(').ok_or_else(malformed)?;
        let inner = rest.strip_suffix(')').ok_or_else(malformed)?;
        if inner.contains('(') || inner.contains(')') {
            return Err(malformed());
        }

        let method = method.trim();
        let kind = QueryKind::from_method(method)
            .ok_or_else(|| ProtocolError::UnknownMethod(method.to_string()))?;

        let args: Vec<&str> = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner.split(',').map(str::trim).collect()
        };

        if args.len() != kind.arity() {
            return Err(ProtocolError::Arity {
                method: kind.method(),
                expected: kind.arity(),
                found: args.len(),
            });
        }
        if let Some(pos) = args.iter().position(|a| a.is_empty()) {
            return Err(ProtocolError::EmptyArgument {
                method: kind.method(),
                position: pos + 1,
            });
        }

        let arg = |i: usize| args[i].to_string();
        Ok(match kind {
            QueryKind::TimesPlayed => Query::TimesPlayed { music_id: arg(0) },
            QueryKind::TimesPlayedByUser => Query::TimesPlayedByUser {
                music_id: arg(0),
                user_id: arg(1),
            },
            QueryKind::TopThreeMusicByUser => Query::TopThreeMusicByUser { user_id: arg(0) },
            QueryKind::TopArtistsByUserGenre => Query::TopArtistsByUserGenre {
                user_id: arg(0),
                genre: arg(1),
            },
        })
    }

    pub fn kind(&self) -> QueryKind {
        match self {
            Query::TimesPlayed { .. } => QueryKind::TimesPlayed,
            Query::TimesPlayedByUser { .. } => QueryKind::TimesPlayedByUser,
            Query::TopThreeMusicByUser { .. } => QueryKind::TopThreeMusicByUser,
            Query::TopArtistsByUserGenre { .. } => QueryKind::TopArtistsByUserGenre,
        }
    }

    /// The user this query is about, if it is user-keyed.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Query::TimesPlayed { .. } => None,
            Query::TimesPlayedByUser { user_id, .. }
            | Query::TopThreeMusicByUser { user_id }
            | Query::TopArtistsByUserGenre { user_id, .. } => Some(user_id),
        }
    }
}

/// Canonical text form; `Query::parse` of the output yields the same query.
impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::TimesPlayed { music_id } => write!(f, "{}({music_id})", methods::TIMES_PLAYED),
            Query::TimesPlayedByUser { music_id, user_id } => {
                write!(f, "{}({music_id},{user_id})", methods::TIMES_PLAYED_BY_USER)
            }
            Query::TopThreeMusicByUser { user_id } => {
                write!(f, "{}({user_id})", methods::TOP_THREE_MUSIC_BY_USER)
            }
            Query::TopArtistsByUserGenre { user_id, genre } => {
                write!(f, "{}({user_id},{genre})", methods::TOP_ARTISTS_BY_USER_GENRE)
            }
        }
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Result payload. Variants mirror `Query` one-to-one so a result can be
/// checked against the query it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryResult {
    TimesPlayed(u64),
    TimesPlayedByUser(u64),
    /// Up to three music ids, most played first.
    TopThreeMusicByUser(Vec<String>),
    /// Up to three artist ids, most played first.
    TopArtistsByUserGenre(Vec<String>),
}

impl QueryResult {
    pub fn kind(&self) -> QueryKind {
        match self {
            QueryResult::TimesPlayed(_) => QueryKind::TimesPlayed,
            QueryResult::TimesPlayedByUser(_) => QueryKind::TimesPlayedByUser,
            QueryResult::TopThreeMusicByUser(_) => QueryKind::TopThreeMusicByUser,
            QueryResult::TopArtistsByUserGenre(_) => QueryKind::TopArtistsByUserGenre,
        }
    }
}
