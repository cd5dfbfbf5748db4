//! Content policy for generated images.

/// Case-insensitive substring denylist.
#[derive(Debug, Clone, Default)]
pub struct ContentPolicy {
    terms: Vec<String>,
}

impl ContentPolicy {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let terms = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self { terms }
    }

    /// The first denylisted term contained in `text`, if any.
    pub fn violation(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.terms
            .iter()
            .find(|term| text.contains(term.as_str()))
            .map(String::as_str)
    }
}
