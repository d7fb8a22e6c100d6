//! Merchant alias table
//!
//! Maps the many observed spellings of a merchant to one canonical name.
//! Entries are exact (brand clusters) or fuzzy (similarity threshold).
//! The table is read-mostly reference data; reloads swap the whole table
//! atomically so concurrent readers never observe a partial update.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Embedded default alias table (compiled into binary)
const DEFAULT_ALIASES: &str = include_str!("../../../config/aliases.toml");

/// A fuzzy alias entry
#[derive(Debug, Clone)]
struct FuzzyAlias {
    pattern: String,
    canonical: String,
    /// Similarity floor in [0,1], relative to the pattern's self-match score
    threshold: f64,
}

/// Immutable snapshot of the alias table
///
/// Construct once, share behind an `Arc`; never mutated in place.
pub struct MerchantAliasTable {
    /// Loose-normalized spelling -> canonical name
    exact: HashMap<String, String>,
    fuzzy: Vec<FuzzyAlias>,
    matcher: SkimMatcherV2,
}

impl std::fmt::Debug for MerchantAliasTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerchantAliasTable")
            .field("exact", &self.exact.len())
            .field("fuzzy", &self.fuzzy.len())
            .finish()
    }
}

impl MerchantAliasTable {
    /// Empty table (no overrides apply)
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            fuzzy: Vec::new(),
            matcher: SkimMatcherV2::default().ignore_case(),
        }
    }

    /// Built-in defaults compiled into the binary
    pub fn embedded() -> Self {
        // The embedded file is validated by tests; a parse failure here is a
        // build defect, so fall back to an empty table rather than panic.
        Self::from_toml(DEFAULT_ALIASES).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Embedded alias table failed to parse");
            Self::empty()
        })
    }

    /// Parse a table from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawAliasFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid alias table: {}", e)))?;

        let mut exact = HashMap::new();
        for cluster in raw.cluster.unwrap_or_default() {
            for spelling in &cluster.spellings {
                exact.insert(loose_key(spelling), cluster.canonical.clone());
            }
            // The canonical name always maps to itself
            exact.insert(loose_key(&cluster.canonical), cluster.canonical.clone());
        }

        let fuzzy = raw
            .fuzzy
            .unwrap_or_default()
            .into_iter()
            .map(|f| FuzzyAlias {
                pattern: loose_key(&f.pattern),
                canonical: f.canonical,
                threshold: f.threshold.clamp(0.0, 1.0),
            })
            .collect();

        Ok(Self {
            exact,
            fuzzy,
            matcher: SkimMatcherV2::default().ignore_case(),
        })
    }

    /// Look up the canonical name for an observed spelling
    ///
    /// Exact cluster entries win over fuzzy ones. Returns `None` when no
    /// entry applies, in which case generic normalization proceeds.
    pub fn canonical(&self, observed: &str) -> Option<String> {
        let key = loose_key(observed);
        if key.is_empty() {
            return None;
        }

        if let Some(canonical) = self.exact.get(&key) {
            return Some(canonical.clone());
        }

        // Fuzzy entries: the pattern must appear as a (possibly gapped)
        // subsequence of the observed text. Similarity is the match score
        // relative to the pattern's self-match score, so thresholds stay
        // in [0,1].
        for alias in &self.fuzzy {
            let self_score = match self.matcher.fuzzy_match(&alias.pattern, &alias.pattern) {
                Some(s) if s > 0 => s,
                _ => continue,
            };
            if let Some(score) = self.matcher.fuzzy_match(&key, &alias.pattern) {
                let similarity = score as f64 / self_score as f64;
                if similarity >= alias.threshold {
                    return Some(alias.canonical.clone());
                }
            }
        }

        None
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.fuzzy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.fuzzy.is_empty()
    }
}

/// Shared, hot-reloadable handle to the alias table
///
/// Readers clone the inner `Arc` and work against an immutable snapshot;
/// `reload`/`replace` swap the whole table in one step. The version counter
/// increments on every swap so callers can tag derived results.
#[derive(Clone)]
pub struct AliasHandle {
    inner: Arc<RwLock<Versioned>>,
}

struct Versioned {
    table: Arc<MerchantAliasTable>,
    version: u64,
}

impl AliasHandle {
    /// Handle over the embedded default table
    pub fn new() -> Self {
        Self::with_table(MerchantAliasTable::embedded())
    }

    /// Handle over an explicit table (tests, custom deployments)
    pub fn with_table(table: MerchantAliasTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Versioned {
                table: Arc::new(table),
                version: 1,
            })),
        }
    }

    /// Load with two-layer resolution (override file, then embedded)
    pub fn load() -> Result<Self> {
        Ok(Self::with_table(load_table()?))
    }

    /// Current immutable snapshot
    pub fn current(&self) -> Arc<MerchantAliasTable> {
        self.inner
            .read()
            .map(|v| v.table.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().table.clone())
    }

    /// Table version; increments on every swap
    pub fn version(&self) -> u64 {
        self.inner
            .read()
            .map(|v| v.version)
            .unwrap_or_else(|poisoned| poisoned.into_inner().version)
    }

    /// Re-read the override file (or embedded defaults) and swap the table
    pub fn reload(&self) -> Result<()> {
        let table = load_table()?;
        self.replace(table);
        Ok(())
    }

    /// Swap in a fully-built table
    pub fn replace(&self, table: MerchantAliasTable) {
        let mut guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.table = Arc::new(table);
        guard.version += 1;
        tracing::info!(version = guard.version, "Alias table swapped");
    }
}

impl Default for AliasHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform override location (~/.local/share/ledgermatch/config/aliases.toml)
pub fn override_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("ledgermatch").join("config").join("aliases.toml"))
}

fn load_table() -> Result<MerchantAliasTable> {
    if let Some(path) = override_path() {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
            tracing::info!(path = %path.display(), "Loading alias table override");
            return MerchantAliasTable::from_toml(&content);
        }
    }
    MerchantAliasTable::from_toml(DEFAULT_ALIASES)
}

/// Loose comparison key: lowercase, alphanumeric and single spaces only
pub(crate) fn loose_key(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

// Raw TOML shapes

#[derive(Debug, Deserialize)]
struct RawAliasFile {
    cluster: Option<Vec<RawCluster>>,
    fuzzy: Option<Vec<RawFuzzy>>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    canonical: String,
    spellings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFuzzy {
    canonical: String,
    pattern: String,
    threshold: f64,
}
