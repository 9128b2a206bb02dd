//! Error types for the Tungsten language
//!
//! Provides structured error handling with source locations.

use crate::token::Span;
use std::fmt;

/// Broad classification of an error, used to tell compile failures from
/// runtime failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Lex,
    Syntax,
    ConstantFold,
    Runtime,
}

/// Error kinds in Tungsten
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    // Lexer errors
    UnexpectedCharacter(char),
    UnterminatedString,
    NewlineInString,
    InvalidEscape(char),
    MalformedNumber(String),

    // Compiler errors
    UnexpectedToken(String),
    ExpectedToken(String, String),
    ExpectedExpression(String),
    DuplicateDeclaration(String),
    BreakOutsideLoop,
    ContinueOutsideLoop,
    InvalidAssignmentTarget,
    StatementOutsideFunction,
    GlobalAfterFunction(String),
    NoFunctions,

    /// A constant subexpression failed to evaluate at compile time
    ConstantFold(String),

    // Runtime errors
    UndefinedGlobal(String),
    UndefinedFunction(String),
    WrongArity {
        name: String,
        expected: usize,
        got: usize,
    },
    TypeMismatch(String, String),
    DivisionByZero,
    IndexOutOfRange(i32, usize),
    NonBooleanCondition(String),
    TypeNotFound(String),
    MemberNotFound(String, String),
    NoMatchingOverload(String, usize),
    HostFailure(String),
    StackOverflow,
    StepLimitExceeded(u64),
    InvalidProgram(String),
}

impl ErrorKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            ErrorKind::UnexpectedCharacter(_)
            | ErrorKind::UnterminatedString
            | ErrorKind::NewlineInString
            | ErrorKind::InvalidEscape(_)
            | ErrorKind::MalformedNumber(_) => ErrorClass::Lex,

            ErrorKind::UnexpectedToken(_)
            | ErrorKind::ExpectedToken(_, _)
            | ErrorKind::ExpectedExpression(_)
            | ErrorKind::DuplicateDeclaration(_)
            | ErrorKind::BreakOutsideLoop
            | ErrorKind::ContinueOutsideLoop
            | ErrorKind::InvalidAssignmentTarget
            | ErrorKind::StatementOutsideFunction
            | ErrorKind::GlobalAfterFunction(_)
            | ErrorKind::NoFunctions => ErrorClass::Syntax,

            ErrorKind::ConstantFold(_) => ErrorClass::ConstantFold,

            _ => ErrorClass::Runtime,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::UnexpectedCharacter(c) => write!(f, "unexpected character '{}'", c),
            ErrorKind::UnterminatedString => write!(f, "unterminated string"),
            ErrorKind::NewlineInString => write!(f, "newline in string literal"),
            ErrorKind::InvalidEscape(c) => write!(f, "invalid escape sequence '\\{}'", c),
            ErrorKind::MalformedNumber(s) => write!(f, "malformed number '{}'", s),
            ErrorKind::UnexpectedToken(t) => write!(f, "unexpected token '{}'", t),
            ErrorKind::ExpectedToken(expected, got) => {
                write!(f, "expected {}, got '{}'", expected, got)
            }
            ErrorKind::ExpectedExpression(got) => write!(f, "expected expression, got '{}'", got),
            ErrorKind::DuplicateDeclaration(name) => {
                write!(f, "'{}' is already declared in this scope", name)
            }
            ErrorKind::BreakOutsideLoop => write!(f, "break outside of loop"),
            ErrorKind::ContinueOutsideLoop => write!(f, "continue outside of loop"),
            ErrorKind::InvalidAssignmentTarget => write!(f, "invalid assignment target"),
            ErrorKind::StatementOutsideFunction => {
                write!(f, "statements are only allowed inside functions")
            }
            ErrorKind::GlobalAfterFunction(name) => {
                write!(f, "global '{}' must be declared before any function", name)
            }
            ErrorKind::NoFunctions => write!(f, "program must define at least one function"),
            ErrorKind::ConstantFold(msg) => write!(f, "in constant expression: {}", msg),
            ErrorKind::UndefinedGlobal(name) => write!(f, "undefined global '{}'", name),
            ErrorKind::UndefinedFunction(name) => write!(f, "undefined function '{}'", name),
            ErrorKind::WrongArity { name, expected, got } => {
                write!(f, "'{}' expects {} arguments, got {}", name, expected, got)
            }
            ErrorKind::TypeMismatch(expected, got) => {
                write!(f, "type mismatch: expected {}, got {}", expected, got)
            }
            ErrorKind::DivisionByZero => write!(f, "division by zero"),
            ErrorKind::IndexOutOfRange(index, len) => {
                write!(f, "index {} out of range for length {}", index, len)
            }
            ErrorKind::NonBooleanCondition(got) => {
                write!(f, "condition must be a bool, got {}", got)
            }
            ErrorKind::TypeNotFound(name) => write!(f, "type '{}' not found", name),
            ErrorKind::MemberNotFound(ty, member) => {
                write!(f, "'{}' has no member '{}'", ty, member)
            }
            ErrorKind::NoMatchingOverload(member, argc) => {
                write!(f, "no overload of '{}' takes {} matching arguments", member, argc)
            }
            ErrorKind::HostFailure(msg) => write!(f, "host error: {}", msg),
            ErrorKind::StackOverflow => write!(f, "stack overflow"),
            ErrorKind::StepLimitExceeded(limit) => {
                write!(f, "step limit of {} instructions exceeded", limit)
            }
            ErrorKind::InvalidProgram(msg) => write!(f, "invalid program: {}", msg),
        }
    }
}

/// A Tungsten error with location information
#[derive(Debug, Clone, PartialEq)]
pub struct TungstenError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub source_line: Option<String>,
}

impl TungstenError {
    pub fn new(kind: ErrorKind, span: Option<Span>) -> Self {
        Self {
            kind,
            span,
            source_line: None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }

    pub fn line(&self) -> Option<usize> {
        self.span.map(|s| s.line)
    }

    pub fn with_source(mut self, source: &str) -> Self {
        if let Some(span) = &self.span {
            if let Some(line) = source.lines().nth(span.line.wrapping_sub(1)) {
                self.source_line = Some(line.to_string());
            }
        }
        self
    }

    /// Attach an already-split source line
    pub fn with_line_text(mut self, text: Option<&str>) -> Self {
        self.source_line = text.map(str::to_string);
        self
    }
}

impl fmt::Display for TungstenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            // Runtime errors only know the line, column 0 means "whole line"
            Some(span) if span.column == 0 => {
                write!(f, "[line {}] Error: {}", span.line, self.kind)?;
                if let Some(ref line) = self.source_line {
                    write!(f, "\n  | {}", line)?;
                }
            }
            Some(span) => {
                write!(f, "[line {}:{}] Error: {}", span.line, span.column, self.kind)?;

                if let Some(ref line) = self.source_line {
                    write!(f, "\n  | {}", line)?;
                    write!(f, "\n  | {}^", " ".repeat(span.column.saturating_sub(1)))?;
                }
            }
            None => write!(f, "Error: {}", self.kind)?,
        }
        Ok(())
    }
}

impl std::error::Error for TungstenError {}

impl From<ErrorKind> for TungstenError {
    fn from(kind: ErrorKind) -> Self {
        TungstenError::new(kind, None)
    }
}

/// Result type for Tungsten operations
pub type Result<T> = std::result::Result<T, TungstenError>;
