//! Compiler diagnostics and their renderer.
//!
//! Every compile-time problem is a [`Diagnostic`]: an error code, a primary
//! source span, optional secondary spans, a message, optional help and
//! notes. The renderer prints the rustc-style annotated-source layout with
//! unconditional ANSI color.

use crate::ast::Span;
use std::collections::HashMap;
use std::fmt::Write as _;

const RED: &str = "\x1b[1;31m";
const BLUE: &str = "\x1b[1;34m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// A span located in a named file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSpan {
    pub file: String,
    pub span: Span,
}

/// A labeled secondary location.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondarySpan {
    pub location: FileSpan,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Stable code: `E0xxx` lexical/parse, `E1xxx` type, `E2xxx` emit.
    pub code: &'static str,
    pub message: String,
    pub primary: FileSpan,
    pub secondary: Vec<SecondarySpan>,
    pub help: Option<String>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(code: &'static str, message: impl Into<String>, primary: FileSpan) -> Self {
        Diagnostic {
            code,
            message: message.into(),
            primary,
            secondary: Vec::new(),
            help: None,
            notes: Vec::new(),
        }
    }

    pub fn with_secondary(mut self, location: FileSpan, label: impl Into<String>) -> Self {
        self.secondary.push(SecondarySpan {
            location,
            label: label.into(),
        });
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Renders diagnostics against the source texts they refer to.
///
/// Sources are keyed by the file name stored in the spans. A span whose file
/// is unknown still renders header and location, just without the annotated
/// source line.
#[derive(Debug)]
pub struct Renderer {
    sources: HashMap<String, String>,
}

impl Renderer {
    pub fn new() -> Self {
        Renderer {
            sources: HashMap::new(),
        }
    }

    pub fn add_source(&mut self, file: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(file.into(), source.into());
    }

    pub fn render(&self, diagnostic: &Diagnostic) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}error[{}]{}{}: {}{}",
            RED, diagnostic.code, RESET, BOLD, diagnostic.message, RESET
        );
        let primary = &diagnostic.primary;
        let _ = writeln!(
            out,
            " {}-->{} {}:{}:{}",
            BLUE, RESET, primary.file, primary.span.line, primary.span.column
        );
        self.render_snippet(&mut out, primary, RED, None);
        for secondary in &diagnostic.secondary {
            let _ = writeln!(
                out,
                " {}-->{} {}:{}:{}",
                BLUE,
                RESET,
                secondary.location.file,
                secondary.location.span.line,
                secondary.location.span.column
            );
            self.render_snippet(&mut out, &secondary.location, CYAN, Some(&secondary.label));
        }
        if let Some(help) = &diagnostic.help {
            let _ = writeln!(out, "{}help{}: {}", CYAN, RESET, help);
        }
        for note in &diagnostic.notes {
            let _ = writeln!(out, "{}note{}: {}", BLUE, RESET, note);
        }
        out
    }

    fn render_snippet(&self, out: &mut String, at: &FileSpan, color: &str, label: Option<&str>) {
        let Some(source) = self.sources.get(&at.file) else {
            return;
        };
        let Some(line_text) = source.lines().nth(at.span.line.saturating_sub(1) as usize) else {
            return;
        };
        let gutter_width = at.span.line.to_string().len();
        let _ = writeln!(out, "{:width$} {}|{}", "", BLUE, RESET, width = gutter_width);
        let _ = writeln!(
            out,
            "{}{}{} {}|{} {}",
            BLUE,
            at.span.line,
            RESET,
            BLUE,
            RESET,
            line_text
        );
        let carets = "^".repeat(at.span.length.max(1) as usize);
        let _ = writeln!(
            out,
            "{:width$} {}|{} {:pad$}{}{}{}{}",
            "",
            BLUE,
            RESET,
            "",
            color,
            carets,
            label.map(|l| format!(" {}", l)).unwrap_or_default(),
            RESET,
            width = gutter_width,
            pad = at.span.column.saturating_sub(1) as usize
        );
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ansi(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c == '\x1b' {
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn test_render_with_carets() {
        let mut renderer = Renderer::new();
        renderer.add_source("main.orus", "let x = yy + 1\n");
        let diag = Diagnostic::new(
            "E1001",
            "undefined variable 'yy'",
            FileSpan {
                file: "main.orus".to_string(),
                span: Span::new(1, 9, 2),
            },
        )
        .with_help("declare it with 'let yy = ...'");
        let text = strip_ansi(&renderer.render(&diag));
        assert!(text.contains("error[E1001]: undefined variable 'yy'"));
        assert!(text.contains("--> main.orus:1:9"));
        assert!(text.contains("let x = yy + 1"));
        assert!(text.contains("        ^^"));
        assert!(text.contains("help: declare it"));
    }

    #[test]
    fn test_render_unknown_file_omits_snippet() {
        let renderer = Renderer::new();
        let diag = Diagnostic::new(
            "E0001",
            "boom",
            FileSpan {
                file: "missing.orus".to_string(),
                span: Span::new(3, 1, 1),
            },
        );
        let text = strip_ansi(&renderer.render(&diag));
        assert!(text.contains("--> missing.orus:3:1"));
        assert!(!text.contains('^'));
    }

    #[test]
    fn test_color_escapes_present() {
        let mut renderer = Renderer::new();
        renderer.add_source("m", "x\n");
        let diag = Diagnostic::new(
            "E0002",
            "msg",
            FileSpan {
                file: "m".to_string(),
                span: Span::new(1, 1, 1),
            },
        );
        assert!(renderer.render(&diag).contains("\x1b[1;31m"));
    }
}
