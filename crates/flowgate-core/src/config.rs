use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowgateError, Result};

/// Top-level Flowgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Execution engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum node executions per invocation before routing to the error handler.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Per-node execution timeout in seconds (0 = no timeout).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            node_timeout_secs: default_node_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        (self.node_timeout_secs > 0).then(|| Duration::from_secs(self.node_timeout_secs))
    }
}

fn default_max_steps() -> usize { 25 }
fn default_node_timeout() -> u64 { 120 }

/// Human-approval gate thresholds and deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Scores at or below this are approved without a reviewer.
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
    /// Scores at or above this are escalated and get a doubled deadline.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    /// Lower bound of the high risk tier.
    #[serde(default = "default_high_risk_threshold")]
    pub high_risk_threshold: f64,
    /// Lower bound of the critical risk tier.
    #[serde(default = "default_critical_risk_threshold")]
    pub critical_risk_threshold: f64,
    /// Window in which identical submissions reuse the pending request.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_high_timeout")]
    pub high_timeout_secs: u64,
    #[serde(default = "default_critical_timeout")]
    pub critical_timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: default_auto_approve_threshold(),
            escalation_threshold: default_escalation_threshold(),
            high_risk_threshold: default_high_risk_threshold(),
            critical_risk_threshold: default_critical_risk_threshold(),
            dedup_window_secs: default_dedup_window(),
            default_timeout_secs: default_timeout(),
            high_timeout_secs: default_high_timeout(),
            critical_timeout_secs: default_critical_timeout(),
        }
    }
}

/// Upper bound for approval deadlines and the dedup window (one year).
pub const MAX_APPROVAL_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

impl ApprovalConfig {
    /// Reject threshold and deadline combinations the gate cannot honor.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("auto_approve_threshold", self.auto_approve_threshold),
            ("escalation_threshold", self.escalation_threshold),
            ("high_risk_threshold", self.high_risk_threshold),
            ("critical_risk_threshold", self.critical_risk_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(FlowgateError::Config(format!(
                    "approval.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.auto_approve_threshold >= self.escalation_threshold {
            return Err(FlowgateError::Config(
                "approval.auto_approve_threshold must be below escalation_threshold".into(),
            ));
        }
        if self.high_risk_threshold > self.critical_risk_threshold {
            return Err(FlowgateError::Config(
                "approval.high_risk_threshold must not exceed critical_risk_threshold".into(),
            ));
        }
        let windows = [
            ("dedup_window_secs", self.dedup_window_secs),
            ("default_timeout_secs", self.default_timeout_secs),
            ("high_timeout_secs", self.high_timeout_secs),
            ("critical_timeout_secs", self.critical_timeout_secs),
        ];
        for (name, value) in windows {
            if value > MAX_APPROVAL_WINDOW_SECS {
                return Err(FlowgateError::Config(format!(
                    "approval.{} must not exceed {} seconds, got {}",
                    name, MAX_APPROVAL_WINDOW_SECS, value
                )));
            }
        }
        if !(self.critical_timeout_secs < self.high_timeout_secs
            && self.high_timeout_secs < self.default_timeout_secs)
        {
            return Err(FlowgateError::Config(
                "approval timeouts must satisfy critical < high < default".into(),
            ));
        }
        Ok(())
    }
}

fn default_auto_approve_threshold() -> f64 { 0.3 }
fn default_escalation_threshold() -> f64 { 0.9 }
fn default_high_risk_threshold() -> f64 { 0.6 }
fn default_critical_risk_threshold() -> f64 { 0.85 }
fn default_dedup_window() -> u64 { 3600 }
fn default_timeout() -> u64 { 1800 }
fn default_high_timeout() -> u64 { 900 }
fn default_critical_timeout() -> u64 { 300 }

/// Persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. When unset, checkpoints and approvals live in memory.
    #[serde(default)]
    pub path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.as_deref().map(expand_home)
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// Settings for the built-in conversational pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub persona: PersonaConfig,
    /// Documents served by the default keyword retriever.
    #[serde(default)]
    pub documents: Vec<DocumentConfig>,
    /// Maximum documents returned per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Patterns used by the default keyword risk scorer.
    #[serde(default = "PipelineConfig::default_risk_patterns")]
    pub risk_patterns: Vec<RiskPatternConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            persona: PersonaConfig::default(),
            documents: Vec::new(),
            top_k: default_top_k(),
            risk_patterns: Self::default_risk_patterns(),
        }
    }
}

impl PipelineConfig {
    /// Built-in risk patterns.
    pub fn default_risk_patterns() -> Vec<RiskPatternConfig> {
        vec![
            RiskPatternConfig {
                pattern: r"(?i)\b(diagnos\w*|prescri\w*|dosage|overdose)\b".to_string(),
                weight: 0.7,
                label: "medical advice".to_string(),
            },
            RiskPatternConfig {
                pattern: r"(?i)\b(lawsuit|sue|legal advice|liabilit\w*)\b".to_string(),
                weight: 0.6,
                label: "legal advice".to_string(),
            },
            RiskPatternConfig {
                pattern: r"(?i)\b(invest\w*|stocks?|crypto\w*|loan)\b".to_string(),
                weight: 0.5,
                label: "financial advice".to_string(),
            },
            RiskPatternConfig {
                pattern: r"(?i)\b(password|ssn|social security|credit card)\b".to_string(),
                weight: 0.8,
                label: "personal data".to_string(),
            },
            RiskPatternConfig {
                pattern: r"(?i)\b(suicide|self[- ]harm|kill)\b".to_string(),
                weight: 0.95,
                label: "safety".to_string(),
            },
        ]
    }
}

fn default_top_k() -> usize { 3 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,
    #[serde(default = "default_persona_tone")]
    pub tone: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            tone: default_persona_tone(),
            instructions: None,
        }
    }
}

fn default_persona_name() -> String { "assistant".to_string() }
fn default_persona_tone() -> String { "neutral".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentConfig {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPatternConfig {
    pub pattern: String,
    pub weight: f64,
    pub label: String,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowgateError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_steps == 0 {
            return Err(FlowgateError::Config("engine.max_steps must be positive".into()));
        }
        self.approval.validate()
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_FLOWGATE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_FLOWGATE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_FLOWGATE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_FLOWGATE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_FLOWGATE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.engine.max_steps, 25);
        assert_eq!(config.approval.auto_approve_threshold, 0.3);
        assert_eq!(config.approval.dedup_window_secs, 3600);
        assert!(config.storage.path.is_none());
        assert_eq!(config.pipeline.risk_patterns.len(), 5);
    }

    #[test]
    fn test_timeout_tiers_must_be_ordered() {
        let toml_str = r#"
[approval]
critical_timeout_secs = 900
high_timeout_secs = 600
"#;
        let err = AppConfig::from_toml(toml_str).unwrap_err();
        assert!(matches!(err, FlowgateError::Config(_)));
    }

    #[test]
    fn test_thresholds_must_be_in_range() {
        let err = AppConfig::from_toml("[approval]\nescalation_threshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("escalation_threshold"));
    }

    #[test]
    fn test_auto_approve_below_escalation() {
        let toml_str = "[approval]\nauto_approve_threshold = 0.9\nescalation_threshold = 0.5\n";
        assert!(AppConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_oversized_approval_window_is_rejected() {
        let err = AppConfig::from_toml(
            "[approval]\ndefault_timeout_secs = 9223372036854775807\n",
        )
        .unwrap_err();
        assert!(matches!(err, FlowgateError::Config(_)));

        let err = AppConfig::from_toml("[approval]\ndedup_window_secs = 100000000\n").unwrap_err();
        assert!(matches!(err, FlowgateError::Config(msg) if msg.contains("dedup_window_secs")));
    }

    #[test]
    fn test_zero_node_timeout_disables_it() {
        let config = AppConfig::from_toml("[engine]\nnode_timeout_secs = 0\n").unwrap();
        assert!(config.engine.node_timeout().is_none());
    }

    #[test]
    fn test_storage_home_expansion() {
        std::env::set_var("HOME", "/home/flowgate");
        let storage = StorageConfig {
            path: Some("~/data/flowgate.db".into()),
        };
        assert_eq!(
            storage.resolved_path().unwrap(),
            PathBuf::from("/home/flowgate/data/flowgate.db")
        );
    }
}
