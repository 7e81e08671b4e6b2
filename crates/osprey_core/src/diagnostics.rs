use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// A half-open region of a source file, 1-based lines and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start_line: usize, start_column: usize, end_line: usize, end_column: usize) -> Self {
        Span {
            start: Position {
                line: start_line,
                column: start_column,
            },
            end: Position {
                line: end_line,
                column: end_column,
            },
        }
    }

    /// Span for values with no source position (builtins, synthesized nodes).
    pub fn unknown() -> Self {
        Span::new(0, 0, 0, 0)
    }

    pub fn is_unknown(&self) -> bool {
        self.start.line == 0
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unknown() {
            write!(f, "<unknown location>")
        } else {
            write!(f, "{}:{}", self.start.line, self.start.column)
        }
    }
}

const RED: &str = "\x1b[1;31m";
const DARK_GRAY: &str = "\x1b[90m";
const WHITE: &str = "\x1b[97m";
const RESET: &str = "\x1b[0m";

/// Render a fatal compiler error against its source text.
///
/// `source` is optional; without it only the header line is produced.
pub fn render_error(path: &str, span: Span, message: &str, source: Option<&str>, use_color: bool) -> String {
    let mut output = String::new();
    if use_color {
        output.push_str(&format!(
            "{RED}error{RESET} {DARK_GRAY}{path}:{span}{RESET}\n  {WHITE}{message}{RESET}\n"
        ));
    } else {
        output.push_str(&format!("error {path}:{span}\n  {message}\n"));
    }
    if let Some(source) = source {
        if let Some(frame) = render_source_frame(source, &span, use_color) {
            output.push_str(&frame);
        }
    }
    output.trim_end().to_string()
}

fn render_source_frame(source: &str, span: &Span, use_color: bool) -> Option<String> {
    let line_index = span.start.line.checked_sub(1)?;
    let line = source.lines().nth(line_index)?;
    let line_no = span.start.line;
    let width = line_no.to_string().len();

    let line_len = line.chars().count();
    let start_col = span.start.column.clamp(1, line_len + 1);
    let end_col = if span.start.line == span.end.line {
        span.end.column.clamp(start_col, line_len.max(start_col))
    } else {
        start_col
    };
    let carets = "^".repeat(end_col - start_col + 1);
    let padding = " ".repeat(start_col - 1);

    let mut output = String::new();
    if use_color {
        output.push_str(&format!("{DARK_GRAY}{:>width$} |{RESET}\n", ""));
        output.push_str(&format!("{DARK_GRAY}{line_no:>width$} |{RESET} {line}\n"));
        output.push_str(&format!(
            "{DARK_GRAY}{:>width$} |{RESET} {padding}{RED}{carets}{RESET}\n",
            ""
        ));
    } else {
        output.push_str(&format!("{:>width$} |\n", ""));
        output.push_str(&format!("{line_no:>width$} | {line}\n"));
        output.push_str(&format!("{:>width$} | {padding}{carets}\n", ""));
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_span_renders_placeholder() {
        assert_eq!(Span::unknown().to_string(), "<unknown location>");
    }

    #[test]
    fn error_frame_points_at_span() {
        let source = "let x = foo(y)\n";
        let rendered = render_error(
            "model.spec",
            Span::new(1, 9, 1, 14),
            "no representation for type",
            Some(source),
            false,
        );
        assert!(rendered.contains("error model.spec:1:9"));
        assert!(rendered.contains("^^^^^^"));
    }
}
