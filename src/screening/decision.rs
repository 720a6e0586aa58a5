//! Decision extraction from free-text model responses.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Sentinel for an unparseable or out-of-range decision.
pub const INVALID: f64 = -1.0;

static DECISION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Decision: (\d+)").expect("decision regex is valid"));

/// Inclusive bounds of the decision scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleConfig {
    pub lower: i64,
    pub upper: i64,
}

impl ScaleConfig {
    /// Returns `None` when `lower > upper`.
    pub fn new(lower: i64, upper: i64) -> Option<Self> {
        (lower <= upper).then_some(Self { lower, upper })
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.lower..=self.upper).contains(&value)
    }

    /// Two-point scales use the include/exclude prompt wording.
    pub fn is_binary(&self) -> bool {
        self.upper - self.lower == 1
    }
}

/// Outcome of parsing one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// The matched "Decision: N" text, empty when nothing matched.
    pub text: String,
    /// The decision value, or [`INVALID`].
    pub value: f64,
}

impl Decision {
    pub fn is_valid(&self) -> bool {
        is_valid(self.value)
    }
}

pub fn is_valid(value: f64) -> bool {
    value != INVALID
}

/// Parse the first "Decision: <integer>" in `response` and check it against `scale`.
pub fn extract(response: &str, scale: ScaleConfig) -> f64 {
    parse(response, scale).value
}

/// Like [`extract`], also returning the matched text for the run log.
pub fn parse(response: &str, scale: ScaleConfig) -> Decision {
    let Some(caps) = DECISION_RE.captures(response) else {
        return Decision {
            text: String::new(),
            value: INVALID,
        };
    };

    let text = caps
        .get(0)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    // Digits that overflow i64 are out of any scale.
    let value = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .filter(|v| scale.contains(*v))
        .map(|v| v as f64)
        .unwrap_or(INVALID);

    Decision { text, value }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale(lower: i64, upper: i64) -> ScaleConfig {
        ScaleConfig::new(lower, upper).unwrap()
    }

    #[test]
    fn in_range_decision_is_returned() {
        assert_eq!(extract("Decision: 3", scale(0, 4)), 3.0);
    }

    #[test]
    fn out_of_range_decision_is_invalid() {
        assert_eq!(extract("Decision: 7", scale(0, 4)), INVALID);
    }

    #[test]
    fn missing_decision_is_invalid() {
        assert_eq!(extract("no decision here", scale(0, 4)), INVALID);
    }

    #[test]
    fn first_match_wins() {
        let text = "Explanation: if unsure say Decision: 2\n---\nDecision: 4";
        let d = parse(text, scale(0, 4));
        assert_eq!(d.value, 2.0);
        assert_eq!(d.text, "Decision: 2");
    }

    #[test]
    fn bounds_are_inclusive() {
        assert_eq!(extract("Decision: 0", scale(0, 1)), 0.0);
        assert_eq!(extract("Decision: 1", scale(0, 1)), 1.0);
    }

    #[test]
    fn matched_text_is_kept_even_when_out_of_range() {
        let d = parse("Decision: 20", scale(0, 19));
        assert_eq!(d.text, "Decision: 20");
        assert!(!d.is_valid());
    }

    #[test]
    fn overflowing_digits_are_invalid() {
        assert_eq!(
            extract("Decision: 99999999999999999999999", scale(0, 4)),
            INVALID
        );
    }

    #[test]
    fn format_must_match_exactly() {
        assert_eq!(extract("decision: 3", scale(0, 4)), INVALID);
        assert_eq!(extract("Decision:3", scale(0, 4)), INVALID);
        assert_eq!(extract("Decision: -1", scale(0, 4)), INVALID);
    }

    #[test]
    fn inverted_scale_is_rejected() {
        assert!(ScaleConfig::new(4, 0).is_none());
        assert!(scale(0, 1).is_binary());
        assert!(!scale(0, 4).is_binary());
    }
}
