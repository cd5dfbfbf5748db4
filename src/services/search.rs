//! Web search through the DuckDuckGo Instant Answer API.

use super::{SearchResult, ServiceError, WebSearch};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    heading: String,
    #[serde(default)]
    abstract_text: String,
    #[serde(default, rename = "AbstractURL")]
    abstract_url: String,
    #[serde(default)]
    results: Vec<Topic>,
    #[serde(default)]
    related_topics: Vec<Topic>,
}

/// A result entry; category entries nest further topics.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Topic {
    #[serde(default, rename = "FirstURL")]
    first_url: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    topics: Vec<Topic>,
}

impl Topic {
    fn flatten<'a>(&'a self, out: &mut Vec<&'a Topic>) {
        if self.topics.is_empty() {
            out.push(self);
        } else {
            for topic in &self.topics {
                topic.flatten(out);
            }
        }
    }
}

/// DuckDuckGo search client.
pub struct DuckDuckGoSearch {
    client: Client,
    url: String,
}

impl DuckDuckGoSearch {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl WebSearch for DuckDuckGoSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, ServiceError> {
        debug!("Searching DuckDuckGo for: {}", query);

        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ServiceError::Api(format!("HTTP {}", response.status())));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        Ok(collect_results(&answer, max_results))
    }
}

/// Abstract first, then direct results, then related topics.
fn collect_results(answer: &InstantAnswer, max_results: usize) -> Vec<SearchResult> {
    let mut results = Vec::new();

    if !answer.abstract_url.is_empty() {
        let title = if answer.heading.is_empty() {
            answer.abstract_url.clone()
        } else {
            answer.heading.clone()
        };
        results.push(SearchResult {
            title,
            url: answer.abstract_url.clone(),
            snippet: answer.abstract_text.clone(),
        });
    }

    let mut topics = Vec::new();
    for topic in answer.results.iter().chain(&answer.related_topics) {
        topic.flatten(&mut topics);
    }

    for topic in topics {
        if topic.first_url.is_empty() || results.iter().any(|r| r.url == topic.first_url) {
            continue;
        }
        let (title, snippet) = match topic.text.split_once(" - ") {
            Some((title, snippet)) => (title.to_string(), snippet.to_string()),
            None => (topic.text.clone(), String::new()),
        };
        results.push(SearchResult {
            title,
            url: topic.first_url.clone(),
            snippet,
        });
    }

    results.truncate(max_results);
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Heading": "Gatto",
        "AbstractText": "Il gatto domestico è un mammifero carnivoro.",
        "AbstractURL": "https://it.wikipedia.org/wiki/Felis_catus",
        "Results": [],
        "RelatedTopics": [
            {"FirstURL": "https://duckduckgo.com/Gattopardo", "Text": "Gattopardo - Romanzo di Tomasi di Lampedusa"},
            {"Name": "Animali", "Topics": [
                {"FirstURL": "https://duckduckgo.com/Leone", "Text": "Leone - Felino africano"},
                {"FirstURL": "https://duckduckgo.com/Tigre", "Text": "Tigre"}
            ]}
        ]
    }"#;

    #[test]
    fn test_collect_results_order() {
        let answer: InstantAnswer = serde_json::from_str(SAMPLE).unwrap();
        let results = collect_results(&answer, 10);

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].title, "Gatto");
        assert_eq!(results[1].title, "Gattopardo");
        assert_eq!(results[1].snippet, "Romanzo di Tomasi di Lampedusa");
        assert_eq!(results[3].title, "Tigre");
        assert!(results[3].snippet.is_empty());
    }

    #[test]
    fn test_collect_results_limit() {
        let answer: InstantAnswer = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(collect_results(&answer, 3).len(), 3);
    }

    #[test]
    fn test_empty_answer() {
        let answer: InstantAnswer = serde_json::from_str("{}").unwrap();
        assert!(collect_results(&answer, 3).is_empty());
    }
}
