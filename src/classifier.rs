//! Failing-check classification.
//!
//! Maps CI check names to coarse failure categories so reaction messages and
//! project lessons can point the agent at the right kind of fix. Patterns are
//! evaluated in table order; the first match wins.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::plugin::types::CiCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Build,
    Typecheck,
    Lint,
    Format,
    Test,
    Security,
    Unknown,
}

impl CheckCategory {
    /// Lower number = more fundamental failure; fix these first.
    pub fn priority(self) -> u8 {
        match self {
            Self::Build => 1,
            Self::Typecheck => 2,
            Self::Lint => 3,
            Self::Format => 3,
            Self::Test => 4,
            Self::Security => 5,
            Self::Unknown => 6,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Build => "Build",
            Self::Typecheck => "Type check",
            Self::Lint => "Lint",
            Self::Format => "Formatting",
            Self::Test => "Tests",
            Self::Security => "Security",
            Self::Unknown => "Other checks",
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            Self::Build => "Fix compilation errors first; nothing downstream is trustworthy until the build is green.",
            Self::Typecheck => "Resolve type errors before touching test failures; they usually share a root cause.",
            Self::Lint => "Run the linter locally and apply its suggested fixes.",
            Self::Format => "Run the project formatter and commit the result; do not hand-format.",
            Self::Test => "Reproduce the failing tests locally and fix the underlying behavior, not the assertions.",
            Self::Security => "Review the flagged dependency or pattern; prefer upgrading over suppressing.",
            Self::Unknown => "Open the check's log output to determine what it verifies.",
        }
    }
}

impl fmt::Display for CheckCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

fn patterns() -> &'static [(Regex, CheckCategory)] {
    static PATTERNS: OnceLock<Vec<(Regex, CheckCategory)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Order matters: a check named "build-and-test" is a build check.
        [
            (r"(?i)build|compile|bundle", CheckCategory::Build),
            (r"(?i)typecheck|type-check|types\b|tsc|mypy", CheckCategory::Typecheck),
            (r"(?i)lint|clippy|eslint|ruff", CheckCategory::Lint),
            (r"(?i)format|fmt\b|prettier", CheckCategory::Format),
            (r"(?i)test|spec\b|jest|pytest|e2e", CheckCategory::Test),
            (r"(?i)security|audit|codeql|snyk|vuln", CheckCategory::Security),
        ]
        .into_iter()
        .map(|(p, c)| (Regex::new(p).expect("static pattern"), c))
        .collect()
    })
}

pub fn classify_check(name: &str) -> CheckCategory {
    for (pattern, category) in patterns() {
        if pattern.is_match(name) {
            return *category;
        }
    }
    CheckCategory::Unknown
}

/// Render failing checks as a stable markdown section, grouped by category in
/// priority order, with a per-category action recommendation.
pub fn format_classified_errors(checks: &[CiCheck]) -> String {
    let mut grouped: Vec<(CheckCategory, Vec<&CiCheck>)> = Vec::new();
    for check in checks {
        let category = classify_check(&check.name);
        match grouped.iter_mut().find(|(c, _)| *c == category) {
            Some((_, list)) => list.push(check),
            None => grouped.push((category, vec![check])),
        }
    }
    grouped.sort_by_key(|(c, _)| c.priority());

    let mut out = String::new();
    for (category, list) in &grouped {
        out.push_str(&format!("### {}\n", category.label()));
        for check in list {
            match &check.url {
                Some(url) => out.push_str(&format!("- {} ({})\n", check.name, url)),
                None => out.push_str(&format!("- {}\n", check.name)),
            }
        }
        out.push_str(&format!("\nAction: {}\n\n", category.recommendation()));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::types::CheckStatus;

    fn check(name: &str) -> CiCheck {
        CiCheck {
            name: name.to_string(),
            status: CheckStatus::Failing,
            url: None,
        }
    }

    #[test]
    fn classification_order() {
        assert_eq!(classify_check("build-and-test"), CheckCategory::Build);
        assert_eq!(classify_check("cargo clippy"), CheckCategory::Lint);
        assert_eq!(classify_check("unit-tests"), CheckCategory::Test);
        assert_eq!(classify_check("CodeQL"), CheckCategory::Security);
        assert_eq!(classify_check("deploy-preview"), CheckCategory::Unknown);
    }

    #[test]
    fn format_groups_by_priority() {
        let checks = vec![check("unit-tests"), check("build"), check("eslint")];
        let out = format_classified_errors(&checks);

        let build = out.find("### Build").unwrap();
        let lint = out.find("### Lint").unwrap();
        let test = out.find("### Tests").unwrap();
        assert!(build < lint && lint < test);
        assert!(out.contains("Action:"));
    }

    #[test]
    fn format_is_stable() {
        let checks = vec![check("tsc"), check("mypy")];
        assert_eq!(
            format_classified_errors(&checks),
            format_classified_errors(&checks)
        );
    }
}
