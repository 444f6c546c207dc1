//! Scrubs credentials out of provider error text before it reaches the
//! snapshot table or the logs.

use once_cell::sync::Lazy;
use regex::Regex;

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"(?i)(api[_-]?key|token|secret|password|authorization)\s*[:=]\s*["']?(?:bearer\s+)?([A-Za-z0-9_\-\.]{6,})["']?"#,
        r"\b(sk-[A-Za-z0-9_\-]{20,})\b",
        r"\b(AKIA[0-9A-Z]{16})\b",
        r"\b([A-Fa-f0-9]{32,})\b",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

const DEFAULT_MAX_CHARS: usize = 4_000;
const LONG_TOKEN_CHARS: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactedText {
    pub content: String,
    pub redaction_count: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct Redactor {
    max_chars: usize,
}

impl Default for Redactor {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
        }
    }
}

impl Redactor {
    pub fn with_max_chars(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn redact(&self, input: &str) -> RedactedText {
        let mut redaction_count = 0usize;
        let mut content = input
            .split(' ')
            .map(|token| {
                let trimmed = token.trim();
                if trimmed.len() > LONG_TOKEN_CHARS
                    && trimmed
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
                {
                    redaction_count += 1;
                    token.replace(trimmed, "[REDACTED_LONG_TOKEN]")
                } else {
                    token.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");

        for pattern in SECRET_PATTERNS.iter() {
            let matches = pattern.find_iter(&content).count();
            if matches == 0 {
                continue;
            }
            redaction_count += matches;
            content = pattern
                .replace_all(&content, |caps: &regex::Captures<'_>| {
                    if caps.len() > 2 {
                        let key = caps.get(1).map(|m| m.as_str()).unwrap_or("secret");
                        format!("{}=[REDACTED]", key.to_ascii_lowercase())
                    } else {
                        "[REDACTED]".to_string()
                    }
                })
                .into_owned();
        }

        let truncated = content.chars().count() > self.max_chars;
        if truncated {
            content = content.chars().take(self.max_chars).collect::<String>();
            content.push_str(" [truncated]");
        }

        RedactedText {
            content,
            redaction_count,
            truncated,
        }
    }
}
