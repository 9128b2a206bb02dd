//! Lexer for the Tungsten language
//!
//! Converts source code into a lazy stream of tokens. Every consumed
//! character is mirrored into the owned [`Diagnostics`] line buffer so later
//! errors can quote their source line.

use std::iter::Peekable;
use std::str::Chars;

use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::token::{lookup_keyword, Span, Token, TokenKind};

/// The lexer state
pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
    diagnostics: Diagnostics,
    ended: bool,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source code
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            diagnostics: Diagnostics::new(),
            ended: false,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    pub fn into_diagnostics(mut self) -> Diagnostics {
        self.diagnostics.finish_source();
        self.diagnostics
    }

    /// Lex the whole source eagerly, ending with a single `End` token
    pub fn tokenize(source: &str) -> (Vec<Token>, Diagnostics) {
        let mut lexer = Lexer::new(source);
        let tokens: Vec<Token> = lexer.by_ref().collect();
        (tokens, lexer.into_diagnostics())
    }

    /// Produce the next token. Past the end of input this keeps returning `End`.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        let span = Span::new(self.line, self.column);

        let Some(ch) = self.advance() else {
            self.diagnostics.finish_source();
            return Token::new(TokenKind::End, span, String::new());
        };

        let kind = match ch {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            ':' => TokenKind::Colon,

            '+' => self.either('=', TokenKind::PlusEqual, TokenKind::Plus),
            '-' => self.either('=', TokenKind::MinusEqual, TokenKind::Minus),
            '*' => self.either('=', TokenKind::StarEqual, TokenKind::Star),
            '/' => self.either('=', TokenKind::SlashEqual, TokenKind::Slash),
            '=' => self.either('=', TokenKind::EqualEqual, TokenKind::Equal),
            '!' => self.either('=', TokenKind::BangEqual, TokenKind::Bang),
            '<' => self.either('=', TokenKind::LessEqual, TokenKind::Less),
            '>' => self.either('=', TokenKind::GreaterEqual, TokenKind::Greater),

            '&' if self.peek_char() == Some('&') => {
                self.advance();
                TokenKind::AndAnd
            }
            '|' if self.peek_char() == Some('|') => {
                self.advance();
                TokenKind::OrOr
            }

            '"' => return self.scan_string(span),

            c if c.is_ascii_digit() => return self.scan_number(c, span),

            c if c.is_alphabetic() || c == '_' => return self.scan_identifier(c, span),

            c => {
                self.diagnostics
                    .raise_syntax_error(ErrorKind::UnexpectedCharacter(c), span);
                return Token::new(TokenKind::Error, span, c.to_string());
            }
        };

        let lexeme = kind.to_string();
        Token::new(kind, span, lexeme)
    }

    /// Advance and return the current character
    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        self.diagnostics.record_char(ch);
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.chars.clone();
        ahead.next();
        ahead.next()
    }

    fn either(&mut self, next: char, matched: TokenKind, single: TokenKind) -> TokenKind {
        if self.peek_char() == Some(next) {
            self.advance();
            matched
        } else {
            single
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.peek_char() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.peek_second() == Some('/') => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Scan a string literal; the opening quote is already consumed
    fn scan_string(&mut self, span: Span) -> Token {
        let mut value = String::new();
        let mut lexeme = String::from("\"");

        loop {
            match self.peek_char() {
                Some('"') => {
                    self.advance();
                    lexeme.push('"');
                    break;
                }
                Some('\\') => {
                    self.advance();
                    lexeme.push('\\');
                    let escape_span = Span::new(self.line, self.column);
                    match self.advance() {
                        Some(c) => {
                            lexeme.push(c);
                            match c {
                                'n' => value.push('\n'),
                                't' => value.push('\t'),
                                'r' => value.push('\r'),
                                '\\' => value.push('\\'),
                                '"' => value.push('"'),
                                other => {
                                    self.diagnostics
                                        .raise_syntax_error(ErrorKind::InvalidEscape(other), escape_span);
                                    value.push(other);
                                }
                            }
                        }
                        None => {
                            self.diagnostics
                                .raise_syntax_error(ErrorKind::UnterminatedString, span);
                            break;
                        }
                    }
                }
                Some('\n') => {
                    self.diagnostics
                        .raise_syntax_error(ErrorKind::NewlineInString, span);
                    break;
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                    lexeme.push(c);
                }
                None => {
                    self.diagnostics
                        .raise_syntax_error(ErrorKind::UnterminatedString, span);
                    break;
                }
            }
        }

        Token::new(TokenKind::String(value), span, lexeme)
    }

    /// Scan a number literal; the first digit is already consumed
    fn scan_number(&mut self, first: char, span: Span) -> Token {
        let mut text = String::from(first);
        self.take_digits(&mut text);

        if self.peek_char() == Some('.') {
            self.advance();
            text.push('.');
            if !self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
                self.diagnostics
                    .raise_syntax_error(ErrorKind::MalformedNumber(text.clone()), span);
                let whole = text.trim_end_matches('.').parse::<f32>().unwrap_or(0.0);
                return Token::new(TokenKind::Float(whole), span, text);
            }
            self.take_digits(&mut text);
            let value = text.parse::<f32>().unwrap_or(0.0);
            return Token::new(TokenKind::Float(value), span, text);
        }

        let value = match text.parse::<i32>() {
            Ok(value) => value,
            Err(_) => {
                self.diagnostics
                    .raise_syntax_error(ErrorKind::MalformedNumber(text.clone()), span);
                0
            }
        };
        Token::new(TokenKind::Int(value), span, text)
    }

    fn take_digits(&mut self, text: &mut String) {
        while let Some(c) = self.peek_char() {
            if !c.is_ascii_digit() {
                break;
            }
            self.advance();
            text.push(c);
        }
    }

    /// Scan an identifier or keyword; the first character is already consumed
    fn scan_identifier(&mut self, first: char, span: Span) -> Token {
        let mut text = String::from(first);

        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.advance();
                text.push(c);
            } else {
                break;
            }
        }

        let kind = if let Some(keyword) = lookup_keyword(&text) {
            keyword
        } else if first.is_uppercase() {
            TokenKind::ClassIdentifier(text.clone())
        } else {
            TokenKind::Identifier(text.clone())
        };
        Token::new(kind, span, text)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Token;

    /// Yields every token up to and including the first `End`
    fn next(&mut self) -> Option<Token> {
        if self.ended {
            return None;
        }
        let token = self.next_token();
        if token.kind == TokenKind::End {
            self.ended = true;
        }
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenize(source: &str) -> Vec<TokenKind> {
        let (tokens, _) = Lexer::tokenize(source);
        tokens
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| *k != TokenKind::End)
            .collect()
    }

    #[test]
    fn test_keywords() {
        let tokens = tokenize("var func return if else while for in break continue new");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Var,
                TokenKind::Func,
                TokenKind::Return,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::While,
                TokenKind::For,
                TokenKind::In,
                TokenKind::Break,
                TokenKind::Continue,
                TokenKind::New,
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens = tokenize("+ - * / = == != < <= > >= ! && || += -= *= /=");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Bang,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::StarEqual,
                TokenKind::SlashEqual,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = tokenize("42 3.25 0 100.0");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Int(42),
                TokenKind::Float(3.25),
                TokenKind::Int(0),
                TokenKind::Float(100.0),
            ]
        );
    }

    #[test]
    fn test_float_without_fraction_is_error_but_returned() {
        let (tokens, diagnostics) = Lexer::tokenize("1.;");
        assert_eq!(tokens[0].kind, TokenKind::Float(1.0));
        assert_eq!(tokens[1].kind, TokenKind::Semicolon);
        assert!(diagnostics.had_error());
    }

    #[test]
    fn test_strings_and_escapes() {
        let tokens = tokenize(r#""hello" "a\tb\"c\\""#);
        assert_eq!(
            tokens,
            vec![
                TokenKind::String("hello".to_string()),
                TokenKind::String("a\tb\"c\\".to_string()),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_recovers() {
        let (tokens, diagnostics) = Lexer::tokenize("\"abc\nvar");
        assert_eq!(tokens[0].kind, TokenKind::String("abc".to_string()));
        assert_eq!(tokens[1].kind, TokenKind::Var);
        assert_eq!(diagnostics.errors().len(), 1);
        assert_eq!(diagnostics.errors()[0].kind, ErrorKind::NewlineInString);
    }

    #[test]
    fn test_identifiers_and_class_identifiers() {
        let tokens = tokenize("foo _bar x1 Math UnityEngine.Debug obj.name");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Identifier("foo".to_string()),
                TokenKind::Identifier("_bar".to_string()),
                TokenKind::Identifier("x1".to_string()),
                TokenKind::ClassIdentifier("Math".to_string()),
                TokenKind::ClassIdentifier("UnityEngine.Debug".to_string()),
                TokenKind::Identifier("obj.name".to_string()),
            ]
        );
    }

    #[test]
    fn test_comments_and_positions() {
        let (tokens, _) = Lexer::tokenize("// header\n  var x;");
        assert_eq!(tokens[0].kind, TokenKind::Var);
        assert_eq!(tokens[0].span, Span::new(2, 3));
        assert_eq!(tokens[1].span, Span::new(2, 7));
    }

    #[test]
    fn test_end_repeats() {
        let mut lexer = Lexer::new("x");
        lexer.next_token();
        assert_eq!(lexer.next_token().kind, TokenKind::End);
        assert_eq!(lexer.next_token().kind, TokenKind::End);
    }

    #[test]
    fn test_unexpected_character() {
        let (tokens, diagnostics) = Lexer::tokenize("@ 1");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[1].kind, TokenKind::Int(1));
        assert_eq!(diagnostics.errors()[0].kind, ErrorKind::UnexpectedCharacter('@'));
    }
}
