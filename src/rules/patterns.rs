//! Payload pattern matching
//!
//! Compiled regex rule sets for application-layer attack syntax carried in
//! packet payloads. Matching is stateless and immediate: any hit fires,
//! windowing does not apply here.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::info;

use crate::config::PayloadConfig;

/// Attack class labels produced by payload rules
pub const LABEL_SQLI: &str = "SQL-Injection";
pub const LABEL_XSS: &str = "XSS-Attack";
pub const LABEL_CMDI: &str = "Command-Injection";

/// A single pattern hit
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub rule_name: String,
    pub label: &'static str,
    pub description: String,
    /// First 100 chars of the matched text
    pub matched: String,
}

/// Compiled detection rule
struct CompiledRule {
    name: &'static str,
    pattern: Regex,
    label: &'static str,
    description: &'static str,
}

/// Payload inspector with compiled rule sets
pub struct PayloadInspector {
    rules: Vec<CompiledRule>,
    max_payload_bytes: usize,
}

impl PayloadInspector {
    pub fn new(config: &PayloadConfig) -> Result<Self> {
        let mut rules = Vec::new();

        if config.detect_sqli {
            rules.extend(Self::compile_sqli_rules()?);
        }
        if config.detect_xss {
            rules.extend(Self::compile_xss_rules()?);
        }
        if config.detect_cmdi {
            rules.extend(Self::compile_cmdi_rules()?);
        }

        info!("Payload inspector initialized with {} rules", rules.len());

        Ok(Self {
            rules,
            max_payload_bytes: config.max_payload_bytes,
        })
    }

    fn compile_sqli_rules() -> Result<Vec<CompiledRule>> {
        let patterns = vec![
            (
                "sqli_union",
                r"(?i)(\bunion\b.*\bselect\b|\bselect\b.*\bunion\b)",
                "SQL UNION injection attempt",
            ),
            (
                "sqli_comment",
                r#"('|")\s*(--|#|/\*)"#,
                "SQL comment injection",
            ),
            (
                "sqli_or_bypass",
                r"(?i)'\s*(or|and)\s*'",
                "SQL OR/AND bypass attempt",
            ),
            (
                "sqli_stacked",
                r"(?i);\s*(drop|delete|insert|update|truncate|alter)\s",
                "SQL stacked query injection",
            ),
            (
                "sqli_sleep",
                r"(?i)(sleep|benchmark|waitfor|delay)\s*\(",
                "SQL time-based injection",
            ),
            (
                "sqli_information_schema",
                r"(?i)information_schema\.(tables|columns|schemata)",
                "SQL information schema access",
            ),
        ];

        Self::compile_patterns(patterns, LABEL_SQLI)
    }

    fn compile_xss_rules() -> Result<Vec<CompiledRule>> {
        let patterns = vec![
            (
                "xss_script_tag",
                r"(?i)<script[^>]*>",
                "XSS script tag injection",
            ),
            (
                "xss_event_handler",
                r"(?i)\bon(error|load|click|mouse|key|focus|blur|change|submit)\s*=",
                "XSS event handler injection",
            ),
            (
                "xss_javascript_uri",
                r"(?i)javascript\s*:",
                "XSS javascript URI",
            ),
            (
                "xss_svg_onload",
                r"(?i)<svg[^>]*\bonload\s*=",
                "XSS SVG onload injection",
            ),
            (
                "xss_iframe",
                r"(?i)<iframe[^>]*\bsrc\s*=",
                "XSS iframe injection",
            ),
        ];

        Self::compile_patterns(patterns, LABEL_XSS)
    }

    fn compile_cmdi_rules() -> Result<Vec<CompiledRule>> {
        let patterns = vec![
            (
                "cmdi_pipe",
                r"[|;&`]\s*(cat|ls|id|whoami|uname|pwd|wget|curl|nc|bash|sh|python|perl|ruby|php)\b",
                "Command injection via pipe/chain",
            ),
            (
                "cmdi_subshell",
                r"\$\([^)]*\)|\$\{[^}]*\}|`[^`]*`",
                "Command injection via subshell",
            ),
            (
                "cmdi_reverse_shell",
                r"(?i)(nc|ncat|netcat|bash|sh|python|perl|ruby|php).*(-e|exec|system|popen)",
                "Potential reverse shell attempt",
            ),
            (
                "cmdi_etc_passwd",
                r"/etc/(passwd|shadow|group)",
                "Sensitive file access attempt",
            ),
        ];

        Self::compile_patterns(patterns, LABEL_CMDI)
    }

    fn compile_patterns(
        patterns: Vec<(&'static str, &str, &'static str)>,
        label: &'static str,
    ) -> Result<Vec<CompiledRule>> {
        patterns
            .into_iter()
            .map(|(name, pattern, desc)| {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("Failed to compile pattern: {}", name))?;
                Ok(CompiledRule {
                    name,
                    pattern: regex,
                    label,
                    description: desc,
                })
            })
            .collect()
    }

    /// Inspect a payload for attack patterns.
    pub fn inspect(&self, payload: &[u8]) -> Vec<PatternMatch> {
        if payload.is_empty() {
            return Vec::new();
        }

        let inspect_data = if payload.len() > self.max_payload_bytes {
            &payload[..self.max_payload_bytes]
        } else {
            payload
        };

        // Lossy conversion keeps binary payloads matchable
        let payload_str = String::from_utf8_lossy(inspect_data);

        let mut matches = Vec::new();
        for rule in &self.rules {
            if let Some(m) = rule.pattern.find(&payload_str) {
                matches.push(PatternMatch {
                    rule_name: rule.name.to_string(),
                    label: rule.label,
                    description: rule.description.to_string(),
                    matched: m.as_str().chars().take(100).collect(),
                });
            }
        }

        matches
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspector() -> PayloadInspector {
        PayloadInspector::new(&PayloadConfig::default()).unwrap()
    }

    #[test]
    fn test_sqli_detection() {
        let payloads = vec![
            "SELECT * FROM users WHERE id=1 UNION SELECT password FROM admin",
            "admin'-- ",
            "1' OR '1'='1",
            "; DROP TABLE users;",
            "SLEEP(5)",
        ];

        let inspector = inspector();
        for payload in payloads {
            let matches = inspector.inspect(payload.as_bytes());
            assert!(
                matches.iter().any(|m| m.label == LABEL_SQLI),
                "Should detect SQLi in: {}",
                payload
            );
        }
    }

    #[test]
    fn test_xss_detection() {
        let payloads = vec![
            "<script>alert('xss')</script>",
            "<img onerror=alert(1)>",
            "javascript:alert(1)",
            "<svg onload=alert(1)>",
        ];

        let inspector = inspector();
        for payload in payloads {
            let matches = inspector.inspect(payload.as_bytes());
            assert!(
                matches.iter().any(|m| m.label == LABEL_XSS),
                "Should detect XSS in: {}",
                payload
            );
        }
    }

    #[test]
    fn test_cmdi_detection() {
        let payloads = vec!["; cat /etc/passwd", "| whoami", "$(id)", "`ls -la`"];

        let inspector = inspector();
        for payload in payloads {
            let matches = inspector.inspect(payload.as_bytes());
            assert!(
                matches.iter().any(|m| m.label == LABEL_CMDI),
                "Should detect command injection in: {}",
                payload
            );
        }
    }

    #[test]
    fn test_clean_payload() {
        let clean = "GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(inspector().inspect(clean.as_bytes()).is_empty());
    }

    #[test]
    fn test_payload_truncation() {
        let config = PayloadConfig { max_payload_bytes: 16, ..Default::default() };
        let inspector = PayloadInspector::new(&config).unwrap();

        // Attack syntax beyond the inspection limit is not seen
        let mut payload = vec![b'A'; 64];
        payload.extend_from_slice(b"' OR '1'='1");
        assert!(inspector.inspect(&payload).is_empty());
    }

    #[test]
    fn test_disabled_category() {
        let config = PayloadConfig { detect_xss: false, ..Default::default() };
        let inspector = PayloadInspector::new(&config).unwrap();
        assert!(inspector.inspect(b"<script>alert(1)</script>").is_empty());
    }
}
