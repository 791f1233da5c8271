//! Quick-dispatch command classification.
//!
//! Simple read-only queries and a narrow set of safe mutations can skip the
//! full refine/freeze/dispatch pipeline. The core only classifies and
//! records: execution happens in the voice layer, which reports the outcome
//! back. Anything outside the allowlists, or matching the blocklist, is
//! refused with a reason and routed to the full pipeline.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickOperation {
    Query,
    SimpleMutation,
}

impl QuickOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuickOperation::Query => "query",
            QuickOperation::SimpleMutation => "simple_mutation",
        }
    }
}

impl std::str::FromStr for QuickOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(QuickOperation::Query),
            "simple_mutation" => Ok(QuickOperation::SimpleMutation),
            other => Err(format!("unknown quick operation '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuickVerdict {
    Allowed,
    Blocked { reason: String },
}

const QUICK_QUERY_PATTERNS: &[&str] = &[
    r"^ls\b",
    r"^tree\b",
    r"^pwd$",
    r"^cat\b",
    r"^head\b",
    r"^tail\b",
    r"^find\b.*-type",
    r"^which\b",
    r"^wc\b",
    r"^git\s+(status|log|diff|branch|show)\b",
    r"^file\b",
    r"^stat\b",
];

const SIMPLE_MUTATION_PATTERNS: &[&str] = &[
    r#"^mkdir\s+(-p\s+)?"?[\w./_-]+"?$"#,
    r#"^touch\s+"?[\w./_-]+"?$"#,
    r"^cp\b",
    r"^mv\b",
    r"^git\s+(add|checkout|switch|branch\s+-[dD]?)\b",
];

const BLOCKED_PATTERNS: &[&str] = &[
    r"\brm\b",
    r"\brmdir\b",
    r"\bsudo\b",
    r"--force",
    r"--hard",
    r"\|",
    r"&&",
    r";\s*",
    r">\s*",
    r"\bchmod\b.*777",
];

fn compiled(patterns: &[&str], cell: &'static OnceLock<Vec<Regex>>) -> &'static Vec<Regex> {
    cell.get_or_init(|| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("static pattern must compile"))
            .collect()
    })
}

fn query_patterns() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(QUICK_QUERY_PATTERNS, &CELL)
}

fn mutation_patterns() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(SIMPLE_MUTATION_PATTERNS, &CELL)
}

fn blocked_patterns() -> &'static Vec<Regex> {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(BLOCKED_PATTERNS, &CELL)
}

/// Classify a command for quick dispatch.
pub fn classify(operation: QuickOperation, command: &str) -> QuickVerdict {
    let command = command.trim();

    // Blocklist wins over everything.
    if blocked_patterns().iter().any(|p| p.is_match(command)) {
        return QuickVerdict::Blocked {
            reason: "Command contains a blocked pattern. Route it through the full pipeline."
                .to_string(),
        };
    }

    let (patterns, reason) = match operation {
        QuickOperation::Query => (
            query_patterns(),
            "Query pattern not recognized. Route it through the full pipeline for safety.",
        ),
        QuickOperation::SimpleMutation => (
            mutation_patterns(),
            "Mutation pattern not recognized. Route it through the full pipeline for safety.",
        ),
    };

    if patterns.iter().any(|p| p.is_match(command)) {
        QuickVerdict::Allowed
    } else {
        QuickVerdict::Blocked { reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_queries_are_allowed() {
        for cmd in ["ls -la", "git status", "cat README.md", "pwd", "git log --oneline"] {
            assert_eq!(classify(QuickOperation::Query, cmd), QuickVerdict::Allowed, "{cmd}");
        }
    }

    #[test]
    fn safe_mutations_are_allowed() {
        for cmd in ["mkdir -p src/new", "touch notes.md", "git add .", "mv a.txt b.txt"] {
            assert_eq!(
                classify(QuickOperation::SimpleMutation, cmd),
                QuickVerdict::Allowed,
                "{cmd}"
            );
        }
    }

    #[test]
    fn destructive_and_compound_commands_are_blocked() {
        for cmd in [
            "rm -rf /",
            "sudo make install",
            "git reset --hard HEAD~3",
            "ls | grep x",
            "echo hi > file",
            "ls && rm x",
            "chmod 777 secrets",
        ] {
            assert!(
                matches!(classify(QuickOperation::Query, cmd), QuickVerdict::Blocked { .. }),
                "{cmd}"
            );
        }
    }

    #[test]
    fn unrecognized_patterns_are_blocked_with_routing_hint() {
        let verdict = classify(QuickOperation::Query, "cargo build");
        match verdict {
            QuickVerdict::Blocked { reason } => assert!(reason.contains("full pipeline")),
            other => panic!("expected blocked, got {other:?}"),
        }

        // A query pattern is not automatically a safe mutation.
        assert!(matches!(
            classify(QuickOperation::SimpleMutation, "ls -la"),
            QuickVerdict::Blocked { .. }
        ));
    }
}
