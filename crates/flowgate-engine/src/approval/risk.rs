use futures::future::BoxFuture;
use regex::Regex;
use sha2::{Digest, Sha256};

use flowgate_core::config::RiskPatternConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::traits::RiskScorer;

/// Stable identity of a draft: SHA-256 over the trimmed text, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

struct RiskPattern {
    regex: Regex,
    weight: f64,
    label: String,
}

/// Pattern-based risk scorer.
///
/// Each matching pattern contributes its weight; weights combine as
/// independent probabilities (`1 - Π(1 - w)`), so several weak signals add
/// up without ever exceeding 1.
pub struct KeywordRiskScorer {
    patterns: Vec<RiskPattern>,
}

impl KeywordRiskScorer {
    pub fn from_config(patterns: &[RiskPatternConfig]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                let regex = Regex::new(&p.pattern).map_err(|e| {
                    FlowgateError::Config(format!("invalid risk pattern '{}': {}", p.label, e))
                })?;
                Ok(RiskPattern {
                    regex,
                    weight: p.weight.clamp(0.0, 1.0),
                    label: p.label.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Labels of the patterns matching `content`.
    pub fn matches(&self, content: &str) -> Vec<&str> {
        self.patterns
            .iter()
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.label.as_str())
            .collect()
    }

    pub fn score_sync(&self, content: &str) -> f64 {
        let safe = self
            .patterns
            .iter()
            .filter(|p| p.regex.is_match(content))
            .fold(1.0, |acc, p| acc * (1.0 - p.weight));
        1.0 - safe
    }
}

impl RiskScorer for KeywordRiskScorer {
    fn score<'a>(&'a self, content: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move { Ok(self.score_sync(content)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_core::config::PipelineConfig;

    fn scorer() -> KeywordRiskScorer {
        KeywordRiskScorer::from_config(&PipelineConfig::default_risk_patterns()).unwrap()
    }

    #[test]
    fn hash_ignores_surrounding_whitespace() {
        assert_eq!(content_hash("  hello\n"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("hello!"));
        assert_eq!(content_hash("hello").len(), 64);
    }

    #[test]
    fn benign_text_scores_zero() {
        assert_eq!(scorer().score_sync("What are your opening hours?"), 0.0);
    }

    #[test]
    fn matches_combine_without_exceeding_one() {
        let s = scorer();
        let single = s.score_sync("What dosage should I take?");
        assert!((single - 0.7).abs() < 1e-9);

        let combined = s.score_sync("What dosage is safe, and should I invest in crypto?");
        assert!(combined > single);
        assert!(combined < 1.0);
        assert_eq!(
            s.matches("dosage and crypto"),
            vec!["medical advice", "financial advice"]
        );
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let bad = vec![RiskPatternConfig {
            pattern: "(".into(),
            weight: 0.5,
            label: "broken".into(),
        }];
        assert!(matches!(
            KeywordRiskScorer::from_config(&bad),
            Err(FlowgateError::Config(_))
        ));
    }

    #[tokio::test]
    async fn trait_score_matches_sync() {
        let s = scorer();
        let score = RiskScorer::score(&s, "my password is hunter2").await.unwrap();
        assert!((score - 0.8).abs() < 1e-9);
    }
}
