use std::collections::{HashMap, HashSet};

/// A file line of a directory listing, after filtering and name correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    /// Query string of the `download` link, identifies the file on the card.
    pub query: String,
    /// Seconds since the Unix epoch; 0 when the listing had no parseable time.
    pub modified: i64,
}

/// A subdirectory line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDir {
    pub name: String,
    /// Raw `href` of the `dir` link, relative to the listing URL.
    pub href: String,
}

/// A parsed directory listing. Both sequences keep listing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub files: Vec<RemoteFile>,
    pub dirs: Vec<RemoteDir>,
}

impl Listing {
    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}

/// Name filtering and correction applied to every listing line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRules {
    /// Exact names to drop.
    pub ignore: HashSet<String>,
    /// Exact-name rewrites, applied before the ignore check.
    pub rename: HashMap<String, String>,
}

impl Default for ListingRules {
    fn default() -> Self {
        Self {
            ignore: HashSet::new(),
            rename: default_renames(),
        }
    }
}

impl ListingRules {
    /// Apply the rewrite table, then decide whether the entry survives.
    /// Returns `None` for ignored and hidden names.
    pub fn admit(&self, name: &str) -> Option<String> {
        let name = self
            .rename
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string());

        if name.starts_with('.') || self.ignore.contains(&name) {
            return None;
        }
        Some(name)
    }
}

/// OSCAR expects `STR.edf`, the card reports `STR.EDF`.
pub fn default_renames() -> HashMap<String, String> {
    HashMap::from([("STR.EDF".to_string(), "STR.edf".to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_edf_is_renamed() {
        let rules = ListingRules::default();
        assert_eq!(rules.admit("STR.EDF").as_deref(), Some("STR.edf"));
        assert_eq!(rules.admit("str.EDF").as_deref(), Some("str.EDF"));
    }

    #[test]
    fn hidden_and_ignored_names_are_dropped() {
        let rules = ListingRules {
            ignore: HashSet::from(["JOURNAL.JNL".to_string()]),
            ..Default::default()
        };
        assert_eq!(rules.admit(".Trashes"), None);
        assert_eq!(rules.admit(".."), None);
        assert_eq!(rules.admit("JOURNAL.JNL"), None);
        assert_eq!(rules.admit("DATALOG").as_deref(), Some("DATALOG"));
    }

    #[test]
    fn ignore_matches_the_rewritten_name() {
        let rules = ListingRules {
            ignore: HashSet::from(["STR.edf".to_string()]),
            ..Default::default()
        };
        assert_eq!(rules.admit("STR.EDF"), None);
    }
}
