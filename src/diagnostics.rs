//! Error manager for compilation and execution
//!
//! Source text is buffered line by line as the lexer walks forward, so a
//! syntax error reported against a line that is still being read is held back
//! until the whole line is known and can be printed under its caret.

use log::error;

use crate::error::{ErrorClass, ErrorKind, TungstenError};
use crate::token::Span;

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Completed source lines
    lines: Vec<String>,
    current: String,
    source_done: bool,
    /// Errors waiting for their source line to complete
    pending: Vec<TungstenError>,
    errors: Vec<TungstenError>,
    had_error: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one source character into the line buffer
    pub fn record_char(&mut self, ch: char) {
        if self.source_done {
            return;
        }
        match ch {
            '\n' => {
                let line = std::mem::take(&mut self.current);
                self.lines.push(line);
                self.flush_pending();
            }
            '\r' => {}
            c => self.current.push(c),
        }
    }

    /// Mark the end of the source; the last partial line becomes complete and
    /// every deferred error is rendered
    pub fn finish_source(&mut self) {
        if self.source_done {
            return;
        }
        if !self.current.is_empty() {
            let line = std::mem::take(&mut self.current);
            self.lines.push(line);
        }
        self.source_done = true;
        self.flush_pending();
    }

    /// Text of a completed source line (1-based)
    pub fn line_text(&self, line: usize) -> Option<&str> {
        line.checked_sub(1)
            .and_then(|idx| self.lines.get(idx))
            .map(String::as_str)
    }

    pub fn raise_syntax_error(&mut self, kind: ErrorKind, span: Span) {
        self.had_error = true;
        let err = TungstenError::new(kind, Some(span));
        if self.source_done || span.line <= self.lines.len() {
            self.emit(err);
        } else {
            self.pending.push(err);
        }
    }

    /// Record a runtime failure and return it with its source line attached.
    /// Only the latest runtime failure is kept; lex and syntax errors stay.
    /// Errors without a line render without an excerpt.
    pub fn raise_runtime_error(&mut self, err: TungstenError) -> TungstenError {
        self.had_error = true;
        let err = match err.line() {
            Some(line) => {
                let text = self.line_text(line).map(str::to_string);
                err.with_line_text(text.as_deref())
            }
            None => err,
        };
        self.errors.retain(|e| e.class() != ErrorClass::Runtime);
        self.emit(err.clone());
        err
    }

    /// The most recent runtime failure, if any
    pub fn last_runtime_error(&self) -> Option<&TungstenError> {
        self.errors.iter().rev().find(|e| e.class() == ErrorClass::Runtime)
    }

    pub fn had_error(&self) -> bool {
        self.had_error
    }

    pub fn errors(&self) -> &[TungstenError] {
        &self.errors
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.pending.len()
    }

    /// All rendered messages, one block per error
    pub fn render(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn flush_pending(&mut self) {
        let completed = self.lines.len();
        let source_done = self.source_done;
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|e| source_done || e.line().map_or(true, |l| l <= completed));
        self.pending = waiting;
        for err in ready {
            self.emit(err);
        }
    }

    fn emit(&mut self, err: TungstenError) {
        let err = match err.line() {
            Some(line) if err.source_line.is_none() => {
                let text = self.line_text(line).map(str::to_string);
                err.with_line_text(text.as_deref())
            }
            _ => err,
        };
        error!("{}", err);
        self.errors.push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(diag: &mut Diagnostics, text: &str) {
        for ch in text.chars() {
            diag.record_char(ch);
        }
    }

    #[test]
    fn test_error_on_incomplete_line_is_deferred() {
        let mut diag = Diagnostics::new();
        feed(&mut diag, "var x = ");
        diag.raise_syntax_error(ErrorKind::UnexpectedCharacter('@'), Span::new(1, 9));

        assert!(diag.had_error());
        assert!(diag.errors().is_empty());
        assert_eq!(diag.error_count(), 1);

        feed(&mut diag, "@;\nfunc");
        assert_eq!(diag.errors().len(), 1);
        assert_eq!(diag.errors()[0].source_line.as_deref(), Some("var x = @;"));
    }

    #[test]
    fn test_finish_flushes_last_line() {
        let mut diag = Diagnostics::new();
        feed(&mut diag, "func main(");
        diag.raise_syntax_error(ErrorKind::UnterminatedString, Span::new(1, 10));
        diag.finish_source();

        assert_eq!(diag.errors().len(), 1);
        assert!(diag.render().contains("func main("));
    }

    #[test]
    fn test_runtime_error_without_line() {
        let mut diag = Diagnostics::new();
        diag.raise_runtime_error(TungstenError::new(ErrorKind::StackOverflow, None));
        assert!(diag.had_error());
        assert_eq!(diag.render(), "Error: stack overflow");
    }

    #[test]
    fn test_runtime_error_gets_source_line() {
        let mut diag = Diagnostics::new();
        feed(&mut diag, "func f() {\n  return 1 / 0;\n}");
        diag.finish_source();
        diag.raise_runtime_error(TungstenError::new(ErrorKind::DivisionByZero, Some(Span::new(2, 0))));
        assert_eq!(diag.errors()[0].source_line.as_deref(), Some("  return 1 / 0;"));
    }

    #[test]
    fn test_only_latest_runtime_error_is_kept() {
        let mut diag = Diagnostics::new();
        feed(&mut diag, "var x = @;\nfunc f() {}");
        diag.raise_syntax_error(ErrorKind::UnexpectedCharacter('@'), Span::new(1, 9));
        diag.finish_source();

        for _ in 0..100 {
            diag.raise_runtime_error(TungstenError::new(ErrorKind::StackOverflow, None));
        }
        let last = diag.raise_runtime_error(TungstenError::new(ErrorKind::DivisionByZero, None));

        assert_eq!(last.kind, ErrorKind::DivisionByZero);
        assert_eq!(diag.errors().len(), 2);
        assert_eq!(diag.errors()[0].kind, ErrorKind::UnexpectedCharacter('@'));
        assert_eq!(diag.last_runtime_error().map(|e| &e.kind), Some(&ErrorKind::DivisionByZero));
    }
}
