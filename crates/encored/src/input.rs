//! Query input file — one `<query> Zone:<n>` per line.

use anyhow::{bail, Context, Result};

use encore_core::ZoneId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLine {
    /// 1-based line number in the input file.
    pub lineno: usize,
    pub query: String,
    pub zone: ZoneId,
}

/// Parse one line. Blank lines and `#` comments yield `None`.
///
/// The query text is not validated here; the client parses it and a
/// malformed query stops that client.
pub fn parse_line(line: &str) -> Result<Option<(String, ZoneId)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (query, zone) = line
        .rsplit_once("Zone:")
        .context("missing `Zone:<n>` suffix")?;
    let query = query.trim();
    if query.is_empty() {
        bail!("missing query before `Zone:`");
    }
    let zone: u32 = zone
        .trim()
        .parse()
        .with_context(|| format!("invalid zone {:?}", zone.trim()))?;
    Ok(Some((query.to_string(), ZoneId(zone))))
}

pub fn parse(text: &str) -> Result<Vec<InputLine>> {
    let mut lines = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let parsed = parse_line(raw).with_context(|| format!("line {}: {raw:?}", i + 1))?;
        if let Some((query, zone)) = parsed {
            lines.push(InputLine {
                lineno: i + 1,
                query,
                zone,
            });
        }
    }
    Ok(lines)
}

/// Deal lines round-robin into `clients` batches, keeping file order
/// within each batch.
pub fn distribute(lines: Vec<InputLine>, clients: usize) -> Vec<Vec<InputLine>> {
    let clients = clients.max(1);
    let mut batches = vec![Vec::new(); clients];
    for (i, line) in lines.into_iter().enumerate() {
        batches[i % clients].push(line);
    }
    batches
}
