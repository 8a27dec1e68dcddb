//! Validation command composition.
//!
//! Builds the ordered command list for one item from the commit policy, the
//! item's own commands, and the frontend-visual / platform-packaging lanes.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

use regex::{Match, Regex};

use crate::core::policy::CommitPolicy;
use crate::core::types::WorkItem;

/// Switches resolved from policy plus environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub allow_full_suite: bool,
    pub frontend_visual_enabled: bool,
    pub frontend_visual_strict: bool,
    /// Interpreter that replaces a leading `python`/`python3`/`py`.
    pub python_launcher: Option<String>,
}

/// Marker the classifier uses to recognise the visual smoke command.
pub const FRONTEND_VISUAL_MARKER: &str = "frontend_visual_smoke";

pub fn compose_validation_commands(
    item: &WorkItem,
    commit: &CommitPolicy,
    options: &CommandOptions,
) -> Vec<String> {
    let mut commands: Vec<String> = commit
        .default_validation_commands
        .iter()
        .chain(item.validation_commands.iter())
        .map(|command| command.trim().to_string())
        .filter(|command| !command.is_empty())
        .collect();

    if commit.validation_scope_guard.enabled && !options.allow_full_suite {
        commands.retain(|command| !is_full_suite_command(command));
    }

    let visual = &commit.frontend_visual_qa;
    if options.frontend_visual_enabled && visual.owner_roles.iter().any(|role| role == &item.owner_role) {
        let mut command = format!(
            "{} --max-overflow-px {} --max-diff-percent {}",
            visual.command, visual.max_overflow_px, visual.max_diff_percent
        );
        if options.frontend_visual_strict {
            command.push_str(" --strict");
        }
        commands.push(command);
    }

    let packaging = &commit.platform_web_packaging_validation;
    if packaging.enabled
        && packaging.owner_roles.iter().any(|role| role == &item.owner_role)
        && item
            .inputs
            .iter()
            .any(|input| packaging.match_inputs_any.iter().any(|p| input_matches(input, p)))
    {
        commands.extend(packaging.commands.iter().cloned());
    }

    let mut seen = HashSet::new();
    commands
        .into_iter()
        .map(|command| normalize_command(&command, options.python_launcher.as_deref()))
        .filter(|command| seen.insert(command.clone()))
        .collect()
}

/// True for discovery runs over the whole test tree.
pub fn is_full_suite_command(command: &str) -> bool {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    for (idx, token) in tokens.iter().enumerate() {
        let rest = &tokens[idx + 1..];
        if *token == "-m" && rest.first() == Some(&"unittest") {
            let args: Vec<&str> = rest[1..].iter().copied().filter(|t| !t.starts_with('-')).collect();
            return args.is_empty() || args[0] == "discover";
        }
        if *token == "pytest" || (*token == "-m" && rest.first() == Some(&"pytest")) {
            let offset = if *token == "pytest" { 0 } else { 1 };
            let targets: Vec<&str> = rest[offset..]
                .iter()
                .copied()
                .filter(|t| !t.starts_with('-'))
                .collect();
            return targets.is_empty()
                || (targets.len() == 1 && matches!(targets[0], "tests" | "tests/" | "./tests" | "./tests/"));
        }
    }
    false
}

/// `*` is a wildcard; a pattern without one matches as a path prefix.
fn input_matches(input: &str, pattern: &str) -> bool {
    let input = input.replace('\\', "/");
    if !pattern.contains('*') {
        return input.starts_with(pattern) || input == pattern;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$"))
        .map(|re| re.is_match(&input))
        .unwrap_or(false)
}

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\S+").expect("token regex"));

/// Swap a leading python launcher and turn `-m unittest path/to/test_x.py`
/// targets into dotted module names. Everything else, quoting and
/// whitespace included, is left byte-for-byte.
pub fn normalize_command(command: &str, launcher: Option<&str>) -> String {
    let tokens: Vec<Match<'_>> = TOKEN_RE.find_iter(command).collect();
    let Some(first) = tokens.first() else {
        return command.to_string();
    };

    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    if let Some(launcher) = launcher.filter(|l| !l.trim().is_empty())
        && matches!(first.as_str(), "python" | "python3" | "py")
    {
        let replacement = if launcher.contains(' ') && !launcher.starts_with('"') {
            format!("\"{launcher}\"")
        } else {
            launcher.to_string()
        };
        edits.push((first.range(), replacement));
    }

    let unittest_at = tokens
        .windows(2)
        .position(|pair| pair[0].as_str() == "-m" && pair[1].as_str() == "unittest");
    if let Some(pos) = unittest_at {
        for token in &tokens[pos + 2..] {
            let text = token.as_str();
            if text.starts_with('-') || !text.ends_with(".py") {
                continue;
            }
            let trimmed = text.trim_end_matches(".py").trim_start_matches("./");
            edits.push((token.range(), trimmed.replace(['/', '\\'], ".")));
        }
    }

    let mut out = String::with_capacity(command.len());
    let mut cursor = 0;
    for (range, replacement) in edits {
        out.push_str(&command[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&command[cursor..]);
    out
}
