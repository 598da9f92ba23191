//! Insertion-ordered link multimap backing the final sitemap report.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Write};

use parking_lot::Mutex;

/// Key under which seed URLs are recorded.
pub const ROOT_KEY: &str = "<root>";

#[derive(Debug, Default)]
struct Entries {
    by_key: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

/// Append-only multimap of `source -> targets` edges.
///
/// Targets keep their arrival order within a key; keys keep first-seen order
/// across the whole run. Appends are serialized internally so workers can
/// record edges concurrently; [`SiteMap::list`] is meant to be called once
/// the crawl has terminated.
#[derive(Debug, Default)]
pub struct SiteMap {
    entries: Mutex<Entries>,
}

impl SiteMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `targets` under `key`, registering the key on first use.
    pub fn add<I, S>(&self, key: &str, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = &mut *self.entries.lock();
        let bucket = match entries.by_key.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                entries.order.push(key.to_string());
                vacant.insert(Vec::new())
            }
        };
        bucket.extend(targets.into_iter().map(Into::into));
    }

    /// Number of distinct keys recorded so far.
    pub fn key_count(&self) -> usize {
        self.entries.lock().order.len()
    }

    /// Writes the report: each key in first-seen order, followed by its
    /// targets in arrival order.
    pub fn list<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let entries = self.entries.lock();
        for key in &entries.order {
            writeln!(out, "Key: {key}")?;
            if let Some(targets) = entries.by_key.get(key) {
                for target in targets {
                    writeln!(out, "\t - {target}")?;
                }
            }
        }
        Ok(())
    }
}
