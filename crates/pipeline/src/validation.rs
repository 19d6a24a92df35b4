//! Agent output validation
//!
//! Checks model output against forbidden/required text and the structural
//! markers expected by each agent mode. A failed check may carry a corrected
//! output; the correction is a textual heuristic, not a guarantee.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

const PLAN_PREAMBLE: &str =
    "I'm in Plan mode, and I need to run a subagent first to gather information.\n\n";
const PLAN_SKELETON: &str = "\n\nHere is the proposed plan:\n1. [Step 1]\n2. [Step 2]\n3. [Step 3]";
const AGENT_PREAMBLE: &str = "I need to use manage_todo_list and runSubagent for this task.\n\n";

/// Result of validating one output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub error: Option<String>,
    /// Suggested replacement for the whole output
    pub corrected: Option<String>,
    pub violations: Vec<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
            corrected: None,
            violations: Vec::new(),
        }
    }

    pub fn invalid(error: impl Into<String>, corrected: Option<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            corrected,
            violations: Vec::new(),
        }
    }

    fn with_violation(mut self, violation: String) -> Self {
        self.violations.push(violation);
        self
    }
}

/// Caller-supplied validator
pub type CustomValidator = Arc<dyn Fn(&[u8]) -> ValidationOutcome + Send + Sync>;

/// Output conventions of the agent modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentMode {
    Plan,
    Agent,
    Ask,
}

impl AgentMode {
    pub fn validate(&self, output: &[u8]) -> ValidationOutcome {
        match self {
            AgentMode::Plan => validate_plan_mode(output),
            AgentMode::Agent => validate_agent_mode(output),
            AgentMode::Ask => validate_ask_mode(output),
        }
    }
}

/// Checks carried by an agent validation rule, run in field order
#[derive(Clone, Default)]
pub struct ValidationRule {
    pub forbidden: Vec<String>,
    pub required: Vec<String>,
    pub enforce_plan_format: bool,
    pub enforce_agent_format: bool,
    pub custom: Option<CustomValidator>,
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("forbidden", &self.forbidden)
            .field("required", &self.required)
            .field("enforce_plan_format", &self.enforce_plan_format)
            .field("enforce_agent_format", &self.enforce_agent_format)
            .field("custom", &self.custom.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ValidationRule {
    pub fn forbid<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn require<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn plan_format(mut self) -> Self {
        self.enforce_plan_format = true;
        self
    }

    pub fn agent_format(mut self) -> Self {
        self.enforce_agent_format = true;
        self
    }

    pub fn custom<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[u8]) -> ValidationOutcome + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(validator));
        self
    }

    /// First failing check, or a valid outcome
    pub fn check(&self, output: &[u8]) -> ValidationOutcome {
        if let Some(custom) = &self.custom {
            let outcome = custom(output);
            if !outcome.valid {
                return outcome;
            }
        }

        let text = String::from_utf8_lossy(output);

        if let Some(hit) = self.forbidden.iter().find(|p| contains_ci(&text, p)) {
            return ValidationOutcome::invalid("Forbidden patterns detected in agent output", None)
                .with_violation(format!("Forbidden pattern: {}", hit));
        }

        let missing: Vec<&String> = self
            .required
            .iter()
            .filter(|p| !contains_ci(&text, p))
            .collect();
        if !missing.is_empty() {
            let mut corrected = text.to_string();
            for pattern in &missing {
                corrected.push_str("\n\n");
                corrected.push_str(pattern);
            }
            let mut outcome = ValidationOutcome::invalid(
                "Required patterns missing from agent output",
                Some(corrected),
            );
            outcome.violations = missing
                .iter()
                .map(|p| format!("Missing required pattern: {}", p))
                .collect();
            return outcome;
        }

        if self.enforce_plan_format && !is_plan_format(&text) {
            return ValidationOutcome::invalid(
                "Output does not match Plan mode format",
                Some(enforce_plan_format(&text)),
            );
        }
        if self.enforce_agent_format && !is_agent_format(&text) {
            return ValidationOutcome::invalid(
                "Output does not match Agent mode format",
                Some(enforce_agent_format(&text)),
            );
        }

        ValidationOutcome::valid()
    }
}

/// Case-insensitive substring test
pub fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn is_plan_format(text: &str) -> bool {
    contains_ci(text, "plan") || contains_ci(text, "runSubagent")
}

fn is_agent_format(text: &str) -> bool {
    contains_ci(text, "manage_todo_list")
        || contains_ci(text, "runSubagent")
        || contains_ci(text, "todo")
}

pub fn enforce_plan_format(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + PLAN_PREAMBLE.len() + PLAN_SKELETON.len());
    if !contains_ci(text, "runSubagent") {
        out.push_str(PLAN_PREAMBLE);
    }
    out.push_str(text);
    if !contains_ci(text, "plan") {
        out.push_str(PLAN_SKELETON);
    }
    out
}

pub fn enforce_agent_format(text: &str) -> String {
    if contains_ci(text, "manage_todo_list") || contains_ci(text, "runSubagent") {
        return text.to_string();
    }
    format!("{}{}", AGENT_PREAMBLE, text)
}

pub fn validate_plan_mode(output: &[u8]) -> ValidationOutcome {
    let text = String::from_utf8_lossy(output);
    if is_plan_format(&text) {
        return ValidationOutcome::valid();
    }
    ValidationOutcome::invalid("Plan mode format violation", Some(enforce_plan_format(&text)))
}

pub fn validate_agent_mode(output: &[u8]) -> ValidationOutcome {
    let text = String::from_utf8_lossy(output);
    if is_agent_format(&text) {
        return ValidationOutcome::valid();
    }
    ValidationOutcome::invalid("Agent mode format violation", Some(enforce_agent_format(&text)))
}

/// Ask mode answers should include a verification step
pub fn validate_ask_mode(output: &[u8]) -> ValidationOutcome {
    let text = String::from_utf8_lossy(output);
    if ["verify", "check", "confirm"].iter().any(|w| contains_ci(&text, w)) {
        return ValidationOutcome::valid();
    }
    ValidationOutcome::invalid("Ask mode should include verification steps", None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_and_required() {
        let rule = ValidationRule::default()
            .forbid(["rm -rf"])
            .require(["Summary:"]);

        let bad = rule.check(b"run RM -RF / now");
        assert!(!bad.valid);
        assert_eq!(bad.violations, vec!["Forbidden pattern: rm -rf"]);
        assert!(bad.corrected.is_none());

        let missing = rule.check(b"all done");
        assert!(!missing.valid);
        assert_eq!(missing.corrected.as_deref(), Some("all done\n\nSummary:"));

        assert!(rule.check(b"summary: all done").valid);
    }

    #[test]
    fn test_plan_mode_correction() {
        let outcome = validate_plan_mode(b"just do it");
        assert!(!outcome.valid);
        let corrected = outcome.corrected.unwrap();
        assert!(corrected.starts_with(PLAN_PREAMBLE));
        assert!(corrected.ends_with("3. [Step 3]"));
        assert!(validate_plan_mode(corrected.as_bytes()).valid);

        assert!(validate_plan_mode(b"My PLAN is simple").valid);
    }

    #[test]
    fn test_agent_and_ask_modes() {
        let outcome = validate_agent_mode(b"hello");
        assert_eq!(
            outcome.corrected.as_deref(),
            Some("I need to use manage_todo_list and runSubagent for this task.\n\nhello")
        );
        assert!(AgentMode::Agent.validate(b"updating the TODO list").valid);

        assert!(AgentMode::Ask.validate(b"Please confirm the path").valid);
        let ask = AgentMode::Ask.validate(b"sure");
        assert!(!ask.valid);
        assert!(ask.corrected.is_none());
    }

    #[test]
    fn test_custom_validator_runs_first() {
        let rule = ValidationRule::default()
            .forbid(["x"])
            .custom(|out: &[u8]| {
                if out.is_empty() {
                    ValidationOutcome::invalid("empty output", Some("(no output)".into()))
                } else {
                    ValidationOutcome::valid()
                }
            });
        assert_eq!(rule.check(b"").error.as_deref(), Some("empty output"));
        assert!(!rule.check(b"x").valid);
        assert!(rule.check(b"y").valid);
    }
}
