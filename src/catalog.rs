/// Remote application bundles in listing order, with a filtered view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleCatalog {
    entries: Vec<String>,
    filter: String,
    filtered: Vec<String>,
}

impl BundleCatalog {
    /// Replace the catalog with a fresh listing, keeping the current filter.
    pub fn replace(&mut self, entries: Vec<String>) {
        self.entries = entries;
        self.refilter();
    }

    pub fn set_filter(&mut self, text: impl Into<String>) {
        self.filter = text.into();
        self.refilter();
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn filtered(&self) -> &[String] {
        &self.filtered
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn refilter(&mut self) {
        self.filtered = filter_bundles(&self.entries, &self.filter);
    }
}

/// Case-insensitive substring match; an empty needle keeps everything.
pub fn filter_bundles(entries: &[String], needle: &str) -> Vec<String> {
    if needle.is_empty() {
        return entries.to_vec();
    }
    let needle = needle.to_lowercase();
    entries
        .iter()
        .filter(|path| path.to_lowercase().contains(&needle))
        .cloned()
        .collect()
}
