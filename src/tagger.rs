//! Deterministic keyword tagger: the first tag (in configured order) with a
//! keyword contained in the lowercased title + body wins; otherwise `other`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::TagRule;
use crate::models::DEFAULT_TAG;

static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

#[derive(Debug, Clone)]
struct CompiledTag {
    name: String,
    keywords: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ArticleTagger {
    tags: Vec<CompiledTag>,
}

impl ArticleTagger {
    /// Keywords are normalized the same way as article text; blank ones are dropped.
    pub fn new(rules: &[TagRule]) -> Self {
        let tags = rules
            .iter()
            .map(|r| CompiledTag {
                name: r.name.trim().to_string(),
                keywords: r
                    .keywords
                    .iter()
                    .map(|k| normalize(k))
                    .filter(|k| !k.is_empty())
                    .collect(),
            })
            .collect();
        Self { tags }
    }

    pub fn tag(&self, title: &str, body: &str) -> &str {
        let text = normalize(&format!("{title} {body}"));
        for t in &self.tags {
            if t.keywords.iter().any(|kw| text.contains(kw.as_str())) {
                return &t.name;
            }
        }
        DEFAULT_TAG
    }

    /// Position of a tag in the configured order; `other` and unknown tags sort last.
    pub fn rank(&self, tag: &str) -> usize {
        self.tags
            .iter()
            .position(|t| t.name == tag)
            .unwrap_or(self.tags.len())
    }
}

fn normalize(s: &str) -> String {
    RE_WS.replace_all(&s.to_lowercase(), " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<TagRule> {
        vec![
            TagRule {
                name: "crime_noise".into(),
                keywords: vec!["arrested".into()],
            },
            TagRule {
                name: "earnings".into(),
                keywords: vec!["quarterly results".into(), "EPS".into()],
            },
            TagRule {
                name: "product_launch".into(),
                keywords: vec!["unveils".into(), "launch".into()],
            },
        ]
    }

    #[test]
    fn first_configured_tag_wins() {
        let t = ArticleTagger::new(&rules());
        // matches both earnings and product_launch; earnings comes first
        assert_eq!(
            t.tag("Apple unveils iPhone", "ahead of quarterly results"),
            "earnings"
        );
        assert_eq!(t.tag("Apple unveils iPhone", ""), "product_launch");
    }

    #[test]
    fn matching_is_case_and_whitespace_insensitive() {
        let t = ArticleTagger::new(&rules());
        assert_eq!(t.tag("", "Beat on eps; QUARTERLY\n  results strong"), "earnings");
    }

    #[test]
    fn falls_back_to_other() {
        let t = ArticleTagger::new(&rules());
        assert_eq!(t.tag("Weather is nice", "nothing here"), DEFAULT_TAG);
        assert_eq!(ArticleTagger::default().tag("anything", "at all"), DEFAULT_TAG);
    }

    #[test]
    fn rank_follows_config_order() {
        let t = ArticleTagger::new(&rules());
        assert_eq!(t.rank("crime_noise"), 0);
        assert_eq!(t.rank("product_launch"), 2);
        assert_eq!(t.rank(DEFAULT_TAG), 3);
    }
}
