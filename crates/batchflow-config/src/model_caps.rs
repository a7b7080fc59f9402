//! Per-model token cap overrides resolved by longest-prefix match (spec
//! §4.9: "model-specific overrides (stored as `{prefix -> token_cap}`
//! resolved by longest-prefix match)").

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelCapOverrides {
    entries: Vec<(String, i64)>,
}

impl ModelCapOverrides {
    pub fn new(entries: Vec<(String, i64)>) -> Self {
        Self { entries }
    }

    pub fn set(&mut self, prefix: impl Into<String>, cap: i64) {
        let prefix = prefix.into();
        if let Some(existing) = self.entries.iter_mut().find(|(p, _)| *p == prefix) {
            existing.1 = cap;
        } else {
            self.entries.push((prefix, cap));
        }
    }

    pub fn longest_prefix_match(&self, model: &str) -> Option<i64> {
        self.entries
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, cap)| *cap)
    }

    pub fn entries(&self) -> &[(String, i64)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut caps = ModelCapOverrides::default();
        caps.set("gpt-4", 1_000_000);
        caps.set("gpt-4o", 3_000_000);
        assert_eq!(caps.longest_prefix_match("gpt-4o-mini"), Some(3_000_000));
        assert_eq!(caps.longest_prefix_match("gpt-4-turbo"), Some(1_000_000));
        assert_eq!(caps.longest_prefix_match("claude-3"), None);
    }

    #[test]
    fn updating_an_existing_prefix_replaces_it() {
        let mut caps = ModelCapOverrides::default();
        caps.set("gpt-4", 1_000_000);
        caps.set("gpt-4", 2_000_000);
        assert_eq!(caps.entries().len(), 1);
        assert_eq!(caps.longest_prefix_match("gpt-4"), Some(2_000_000));
    }
}
