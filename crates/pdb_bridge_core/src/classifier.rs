//! Text heuristics applied to debugger output.
//!
//! pdb has no structured response format, so every control decision that
//! depends on response content (start-up success, breakpoint numbers, deletion
//! confirmations) goes through the functions in this module.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Startup output containing one of these (and no prompt) is a failed start.
const ERROR_KEYWORDS: &[&str] = &[
    "Error",
    "Traceback (most recent call last)",
    "No such file or directory",
    "command not found",
];

/// Messages printed by the fast tool when the working directory is not a project it manages.
const FAST_TOOL_REJECTIONS: &[&str] = &[
    "No `pyproject.toml` found",
    "No `project` table found",
    "does not appear to be a Python project",
];

const CURRENT_LINE_MARKER: &str = "-> ";

static BREAKPOINT_CREATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Breakpoint (\d+) at \S").expect("breakpoint confirmation pattern is valid")
});

static BREAKPOINT_DELETED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Deleted breakpoint \d+").expect("breakpoint deletion pattern is valid")
});

static NO_SUCH_BREAKPOINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(no breakpoint (numbered|at)|there is no breakpoint|no breakpoints? set|breakpoint \d+ already deleted|breakpoint number \d+ out of range)",
    )
        .expect("missing breakpoint pattern is valid")
});

static LISTING_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s+breakpoint\s+\S+\s+\S+\s+at\s+(.+):(\d+)\s*$")
        .expect("breakpoint listing pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Ordinary,
    /// Runs the debuggee until the next stop; gets a multiplied drain budget.
    LongRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupVerdict {
    Ready,
    SlowStart { warning: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedBreakpoint {
    pub number: String,
    pub path: String,
    pub line: u32,
}

/// Also matches the nested prompt of a recursive `debug`, e.g. `((Pdb))`.
pub fn ends_with_prompt(line: &str, prompt_marker: &str) -> bool {
    let marker = prompt_marker.trim_end_matches(')');
    !marker.is_empty() && line.trim().trim_end_matches(')').ends_with(marker)
}

fn has_startup_marker(output: &str, prompt_marker: &str) -> bool {
    output.lines().any(|line| {
        ends_with_prompt(line, prompt_marker) || line.trim_start().starts_with(CURRENT_LINE_MARKER)
    })
}

pub fn contains_error_keyword(output: &str) -> bool {
    ERROR_KEYWORDS.iter().any(|keyword| output.contains(keyword))
}

pub fn classify_startup(output: &str, process_alive: bool, prompt_marker: &str) -> StartupVerdict {
    if !process_alive {
        return StartupVerdict::Failed {
            reason: "debugger process exited during startup".to_string(),
        };
    }
    if has_startup_marker(output, prompt_marker) {
        return StartupVerdict::Ready;
    }
    if contains_error_keyword(output) {
        return StartupVerdict::Failed {
            reason: "startup output reports an error and no debugger prompt appeared".to_string(),
        };
    }
    StartupVerdict::SlowStart {
        warning: format!(
            "Warning: no '{prompt_marker}' prompt seen yet; the debugger may still be starting."
        ),
    }
}

/// pdb prefixes its own error messages with `***`.
pub fn is_error_response(response: &str) -> bool {
    response
        .lines()
        .any(|line| line.trim_start().starts_with("***"))
        || response.contains("Error")
}

pub fn parse_breakpoint_number(response: &str) -> Option<String> {
    BREAKPOINT_CREATED
        .captures(response)
        .map(|caps| caps[1].to_string())
}

pub fn indicates_deletion(response: &str) -> bool {
    BREAKPOINT_DELETED.is_match(response)
}

pub fn indicates_no_such_breakpoint(response: &str) -> bool {
    NO_SUCH_BREAKPOINT.is_match(response)
}

pub fn parse_breakpoint_listing(listing: &str) -> Vec<ListedBreakpoint> {
    listing
        .lines()
        .filter_map(|line| {
            let caps = LISTING_ROW.captures(line)?;
            Some(ListedBreakpoint {
                number: caps[1].to_string(),
                path: caps[2].trim().to_string(),
                line: caps[3].parse().ok()?,
            })
        })
        .collect()
}

/// True when the live listing has a breakpoint at `line` whose path is either
/// `absolute` or ends with `relative`.
pub fn listing_confirms(listing: &str, relative: &Path, absolute: &Path, line: u32) -> bool {
    parse_breakpoint_listing(listing).iter().any(|listed| {
        let path = Path::new(&listed.path);
        listed.line == line && (path == absolute || path.ends_with(relative))
    })
}

pub fn fast_tool_rejected_project(output: &str) -> bool {
    FAST_TOOL_REJECTIONS
        .iter()
        .any(|message| output.contains(message))
}

fn command_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or_default()
}

pub fn command_class(command: &str) -> CommandClass {
    match command_word(command) {
        "c" | "cont" | "continue" | "r" | "return" | "unt" | "until" | "run" | "restart" => {
            CommandClass::LongRunning
        }
        _ => CommandClass::Ordinary,
    }
}

/// Commands after which the current source location is reported back.
pub fn is_navigation_command(command: &str) -> bool {
    matches!(
        command_word(command),
        "s" | "step" | "n" | "next" | "c" | "cont" | "continue" | "r" | "return" | "unt" | "until"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMPT: &str = "(Pdb)";

    #[test]
    fn startup_with_prompt_is_ready() {
        let output = "> /proj/script.py(1)<module>()\n-> import os\n(Pdb)";
        assert_eq!(classify_startup(output, true, PROMPT), StartupVerdict::Ready);
    }

    #[test]
    fn startup_with_current_line_marker_but_no_prompt_is_ready() {
        let output = "> /proj/script.py(1)<module>()\n-> import os";
        assert_eq!(classify_startup(output, true, PROMPT), StartupVerdict::Ready);
    }

    #[test]
    fn startup_error_without_prompt_fails() {
        let output = "Traceback (most recent call last):\nModuleNotFoundError: No module named 'pdbx'";
        assert!(matches!(
            classify_startup(output, true, PROMPT),
            StartupVerdict::Failed { .. }
        ));
    }

    #[test]
    fn startup_error_text_with_prompt_still_ready() {
        let output = "> /proj/script.py(1)<module>()\n-> raise ValueError('x')\n(Pdb)";
        assert_eq!(classify_startup(output, true, PROMPT), StartupVerdict::Ready);
    }

    #[test]
    fn silent_live_child_is_slow_start() {
        match classify_startup("", true, PROMPT) {
            StartupVerdict::SlowStart { warning } => assert!(warning.contains("(Pdb)")),
            other => panic!("expected slow start, got {other:?}"),
        }
    }

    #[test]
    fn exited_child_always_fails() {
        let output = "> /proj/script.py(1)<module>()\n(Pdb)";
        assert!(matches!(
            classify_startup(output, false, PROMPT),
            StartupVerdict::Failed { .. }
        ));
    }

    #[test]
    fn parses_breakpoint_confirmation_number() {
        assert_eq!(
            parse_breakpoint_number("Breakpoint 3 at /proj/script.py:10\n(Pdb)"),
            Some("3".to_string())
        );
        assert_eq!(parse_breakpoint_number("*** Blank or comment\n(Pdb)"), None);
        assert_eq!(
            parse_breakpoint_number("1   breakpoint   keep yes   at /proj/script.py:10"),
            None
        );
    }

    #[test]
    fn detects_error_responses() {
        assert!(is_error_response("*** 'nope.py' not found from sys.path"));
        assert!(is_error_response("NameError: name 'x' is not defined"));
        assert!(!is_error_response("Breakpoint 1 at /proj/a.py:3"));
    }

    #[test]
    fn detects_deletion_and_missing_breakpoints() {
        assert!(indicates_deletion("Deleted breakpoint 2 at /proj/a.py:4"));
        assert!(!indicates_deletion("*** There is no breakpoint at /proj/a.py:4"));
        assert!(indicates_no_such_breakpoint("*** There is no breakpoint at /proj/a.py:4"));
        assert!(indicates_no_such_breakpoint("*** No breakpoint numbered 7"));
        assert!(!indicates_no_such_breakpoint("Deleted breakpoint 2 at /proj/a.py:4"));
    }

    #[test]
    fn clear_by_number_replies_count_as_missing() {
        assert!(indicates_no_such_breakpoint("*** Breakpoint 1 already deleted\n(Pdb) "));
        assert!(indicates_no_such_breakpoint("*** Breakpoint number 12 out of range"));
        assert!(!indicates_deletion("*** Breakpoint 1 already deleted"));
    }

    #[test]
    fn parses_listing_rows_and_ignores_hit_counts() {
        let listing = "Num Type         Disp Enb   Where\n\
                       1   breakpoint   keep yes   at /proj/src/app.py:12\n\
                       \tbreakpoint already hit 2 times\n\
                       4   breakpoint   keep yes   at /proj/tests/test_app.py:7\n\
                       (Pdb)";
        let rows = parse_breakpoint_listing(listing);
        assert_eq!(
            rows,
            vec![
                ListedBreakpoint {
                    number: "1".to_string(),
                    path: "/proj/src/app.py".to_string(),
                    line: 12,
                },
                ListedBreakpoint {
                    number: "4".to_string(),
                    path: "/proj/tests/test_app.py".to_string(),
                    line: 7,
                },
            ]
        );
    }

    #[test]
    fn listing_confirms_by_relative_suffix_or_absolute_path() {
        let listing = "1   breakpoint   keep yes   at /proj/src/app.py:12";
        let abs = Path::new("/proj/src/app.py");
        assert!(listing_confirms(listing, Path::new("src/app.py"), abs, 12));
        assert!(listing_confirms(listing, Path::new("other.py"), abs, 12));
        assert!(!listing_confirms(listing, Path::new("src/app.py"), Path::new("/x/app.py"), 13));
        assert!(!listing_confirms(listing, Path::new("pp.py"), Path::new("/x/app.py"), 12));
    }

    #[test]
    fn classifies_commands_by_first_word() {
        assert_eq!(command_class("c"), CommandClass::LongRunning);
        assert_eq!(command_class("until 40"), CommandClass::LongRunning);
        assert_eq!(command_class("p x"), CommandClass::Ordinary);
        assert_eq!(command_class(""), CommandClass::Ordinary);
        assert!(is_navigation_command("n"));
        assert!(is_navigation_command(" step "));
        assert!(!is_navigation_command("p n"));
        assert!(!is_navigation_command("run"));
    }

    #[test]
    fn recognizes_fast_tool_project_rejection() {
        assert!(fast_tool_rejected_project(
            "error: No `pyproject.toml` found in current directory or any parent directory"
        ));
        assert!(!fast_tool_rejected_project("> /proj/a.py(1)<module>()"));
    }

    #[test]
    fn prompt_detection_trims_whitespace() {
        assert!(ends_with_prompt("(Pdb) ", PROMPT));
        assert!(ends_with_prompt("--Return--\n(Pdb)", PROMPT));
        assert!(!ends_with_prompt("(Pdb) p x", PROMPT));
    }

    #[test]
    fn nested_debugger_prompt_is_detected() {
        assert!(ends_with_prompt("((Pdb)) ", PROMPT));
        assert!(ends_with_prompt("(((Pdb)))", PROMPT));
        assert!(!ends_with_prompt("print(x)", PROMPT));
        assert!(!ends_with_prompt("(Pdb) p (x)", PROMPT));
    }
}
