//! The consumer's own string database.
//!
//! STRING_DATA payloads append `[id][nul-terminated text]` entries; the
//! database keeps one copy of every entry's text in a contiguous blob and
//! maps ids to byte offsets into it. Producers ship each id at most once
//! per reset, but re-attaches and resets can replay entries, so insertion
//! is idempotent.

use hopscotch_ipc::wire::string_entries;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct StringDb {
    offsets: FxHashMap<u64, usize>,
    text: String,
}

impl StringDb {
    pub fn new() -> StringDb {
        StringDb::default()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Ingests one STRING_DATA payload (or any slice of the producer's
    /// string image). Returns the ids that were new to this database.
    pub fn add_string_data(&mut self, payload: &[u8]) -> Vec<u64> {
        let mut added = Vec::new();
        for (id, entry_text) in string_entries(payload) {
            if id == 0 {
                continue;
            }
            if let std::collections::hash_map::Entry::Vacant(slot) = self.offsets.entry(id) {
                slot.insert(self.text.len());
                self.text.push_str(entry_text);
                self.text.push('\0');
                added.push(id);
            }
        }
        added
    }

    /// The text behind an id; `None` for the reserved id 0 and for ids
    /// never delivered.
    pub fn get(&self, id: u64) -> Option<&str> {
        let &offset = self.offsets.get(&id)?;
        let rest = &self.text[offset..];
        Some(&rest[..rest.find('\0').unwrap_or(rest.len())])
    }

    /// Ids of all entries whose text contains `needle`, ignoring case.
    pub fn find_matching(&self, needle: &str) -> Vec<u64> {
        let needle = needle.to_lowercase();
        let mut ids: Vec<u64> = self
            .offsets
            .iter()
            .filter(|(_, &offset)| {
                let rest = &self.text[offset..];
                let entry = &rest[..rest.find('\0').unwrap_or(rest.len())];
                entry.to_lowercase().contains(&needle)
            })
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.text.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entries: &[(u64, &str)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (id, text) in entries {
            data.extend_from_slice(&id.to_le_bytes());
            data.extend_from_slice(text.as_bytes());
            let padded = (text.len() + 1 + 7) & !7;
            data.resize(data.len() + padded - text.len(), 0);
        }
        data
    }

    #[test]
    fn ingests_and_resolves_entries() {
        let mut db = StringDb::new();
        let added = db.add_string_data(&image(&[(10, "main.rs"), (20, "render")]));
        assert_eq!(added, vec![10, 20]);
        assert_eq!(db.get(10), Some("main.rs"));
        assert_eq!(db.get(20), Some("render"));
        assert_eq!(db.get(30), None);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn repeated_entries_are_ignored() {
        let mut db = StringDb::new();
        db.add_string_data(&image(&[(10, "main.rs")]));
        let added = db.add_string_data(&image(&[(10, "main.rs"), (11, "other.rs")]));
        assert_eq!(added, vec![11]);
        assert_eq!(db.len(), 2);
        assert_eq!(db.get(10), Some("main.rs"));
    }

    #[test]
    fn reserved_zero_id_is_never_stored() {
        let mut db = StringDb::new();
        let added = db.add_string_data(&image(&[(0, "ghost")]));
        assert!(added.is_empty());
        assert_eq!(db.get(0), None);
    }

    #[test]
    fn substring_search_is_case_insensitive() {
        let mut db = StringDb::new();
        db.add_string_data(&image(&[
            (1, "RenderFrame"),
            (2, "update_physics"),
            (3, "render_shadow"),
        ]));
        assert_eq!(db.find_matching("render"), vec![1, 3]);
        assert_eq!(db.find_matching("PHYSICS"), vec![2]);
        assert!(db.find_matching("audio").is_empty());
    }

    #[test]
    fn clear_forgets_entries() {
        let mut db = StringDb::new();
        db.add_string_data(&image(&[(10, "main.rs")]));
        db.clear();
        assert!(db.is_empty());
        assert_eq!(db.get(10), None);
    }
}
