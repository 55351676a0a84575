//! Python traceback parsing and remediation hints.

use std::sync::OnceLock;

use regex::Regex;

/// The final exception of a traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedException {
    /// Exception class as printed, e.g. `ValueError` or `json.decoder.JSONDecodeError`.
    pub kind: String,
    pub message: String,
    /// Innermost frame line that belongs to the program file.
    pub line: Option<u32>,
}

struct Patterns {
    header: Regex,
    frame: Regex,
    exception: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Some(Patterns {
                header: Regex::new(r"^Traceback \(most recent call last\):\s*$").ok()?,
                frame: Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)"#).ok()?,
                exception: Regex::new(
                    r"^(?P<kind>(?:[A-Za-z_][A-Za-z0-9_]*\.)*[A-Z][A-Za-z0-9_]*)(?::[ ]?(?P<message>.*))?$",
                )
                .ok()?,
            })
        })
        .as_ref()
}

/// Extract the last exception from interpreter stderr.
///
/// Only the final traceback block counts (chained exceptions print the
/// original first). Compile-time errors such as `SyntaxError` print frames
/// without a `Traceback` header; those are handled too. Returns `None` when
/// stderr holds no recognisable exception.
pub fn parse_traceback(stderr: &str, program_file: &str) -> Option<ParsedException> {
    let re = patterns()?;
    let lines: Vec<&str> = stderr.lines().collect();

    let block_start = lines
        .iter()
        .rposition(|l| re.header.is_match(l))
        .or_else(|| lines.iter().position(|l| re.frame.is_match(l)))?;

    let mut program_line = None;
    let mut last_frame = block_start;
    for (i, text) in lines.iter().enumerate().skip(block_start) {
        if let Some(caps) = re.frame.captures(text) {
            last_frame = i;
            if caps["file"].ends_with(program_file) {
                program_line = caps["line"].parse().ok();
            }
        }
    }

    lines[last_frame + 1..]
        .iter()
        .filter(|l| !l.starts_with(char::is_whitespace))
        .find_map(|l| re.exception.captures(l.trim_end()))
        .map(|caps| ParsedException {
            kind: caps["kind"].to_string(),
            message: caps
                .name("message")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            line: program_line,
        })
}

/// Remediation hint for well-known exception kinds. Module-qualified kinds
/// are matched on their last segment.
pub fn hint_for(kind: &str) -> Option<&'static str> {
    let short = kind.rsplit('.').next().unwrap_or(kind);
    let hint = match short {
        "NameError" | "UnboundLocalError" => {
            "A name is used before it is defined. Check the spelling and make sure it is assigned first."
        }
        "SyntaxError" => {
            "Check for a missing colon, unbalanced brackets or quotes, or a misspelled keyword."
        }
        "IndentationError" | "TabError" => {
            "Indent each block consistently (4 spaces per level) and do not mix tabs with spaces."
        }
        "TypeError" => {
            "An operation received a value of the wrong type. Check argument types and conversions such as int() or str()."
        }
        "ValueError" => {
            "A value has the right type but an unusable content, for example int(\"abc\")."
        }
        "IndexError" => "A sequence index is out of range. Check the length before indexing.",
        "KeyError" => "A dictionary key is missing. Test with `in` or use dict.get() first.",
        "AttributeError" => {
            "The object has no such attribute or method. Check its type and the spelling."
        }
        "ZeroDivisionError" => "Division by zero. Check the divisor before dividing.",
        "RecursionError" => {
            "Recursion went too deep. Make sure the recursion has a base case, or use a loop."
        }
        "MemoryError" => "The program ran out of memory. Work with smaller data.",
        "ModuleNotFoundError" | "ImportError" => {
            "Only the Python standard library is available in the sandbox."
        }
        _ => return None,
    };
    Some(hint)
}

pub const TIMEOUT_HINT: &str =
    "The program ran longer than allowed. Look for an infinite loop or reduce the amount of work.";

/// Symbolic name and hint for a terminating signal.
pub fn describe_signal(signal: i32) -> (&'static str, Option<&'static str>) {
    match signal {
        libc::SIGKILL => (
            "SIGKILL",
            Some("The process was killed, usually for exceeding a resource limit."),
        ),
        libc::SIGXCPU => ("SIGXCPU", Some("The CPU time limit was exceeded.")),
        libc::SIGXFSZ => ("SIGXFSZ", Some("The file size limit was exceeded.")),
        libc::SIGSEGV => ("SIGSEGV", Some("The interpreter crashed (segmentation fault).")),
        libc::SIGABRT => ("SIGABRT", Some("The interpreter aborted.")),
        libc::SIGBUS => ("SIGBUS", None),
        libc::SIGFPE => ("SIGFPE", None),
        libc::SIGTERM => ("SIGTERM", None),
        libc::SIGINT => ("SIGINT", None),
        libc::SIGPIPE => ("SIGPIPE", None),
        _ => ("unknown signal", None),
    }
}
