//! Compiler: source → bytecode in a single pass
//!
//! Tokens are pulled from the lexer on demand and instructions are emitted
//! as soon as each construct is recognised; there is no syntax tree.
//! Expressions use precedence climbing over a rule table, locals are
//! resolved to stack slots at compile time, and literal-only subexpressions
//! are folded by running them on a throwaway [`Interpreter`].

use std::collections::HashMap;

use log::{debug, trace};

use crate::bytecode::{FuncInfo, Instruction, OpCode, Operand, ProgramInfo, REGGLOBAL, UNPATCHED};
use crate::diagnostics::Diagnostics;
use crate::error::ErrorKind;
use crate::lexer::Lexer;
use crate::token::{Span, Token, TokenKind};
use crate::value::Value;
use crate::vm::Interpreter;

/// Name of the hidden local holding a `for` loop's enumerator
const ENUMERATOR_LOCAL: &str = "$enumerator";

/// Binding power, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // = += -= *= /=
    Or,         // ||
    And,        // &&
    Comparison, // == != < <= > >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Subscript,  // []
    Member,     // :
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Subscript,
            Precedence::Subscript | Precedence::Member => Precedence::Member,
        }
    }
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

impl<'a> ParseRule<'a> {
    fn new(prefix: Option<ParseFn<'a>>, infix: Option<ParseFn<'a>>, precedence: Precedence) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

/// Locals declared in one block, in declaration order
#[derive(Debug, Default)]
struct Scope {
    names: Vec<String>,
}

#[derive(Debug)]
struct LoopContext {
    /// Where `continue` jumps
    top: usize,
    /// Scopes below this depth survive `break` and `continue`
    depth: usize,
    breaks: Vec<usize>,
}

/// The bytecode compiler
pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    current: Token,
    previous: Token,
    panic_mode: bool,

    code: Vec<Instruction>,
    functions: HashMap<String, FuncInfo>,
    global_names: Vec<String>,
    /// Set once the global initializer function has been closed off
    globals_closed: bool,

    scopes: Vec<Scope>,
    loops: Vec<LoopContext>,

    /// Lowest address folding may rewrite; raised at every jump target
    jump_barrier: usize,
}

impl<'a> Compiler<'a> {
    /// Compile a whole program. On failure the diagnostics hold every error.
    pub fn compile(source: &'a str) -> Result<ProgramInfo, Diagnostics> {
        let mut compiler = Compiler::new(source);
        compiler.advance();
        compiler.program();
        compiler.finish()
    }

    fn new(source: &'a str) -> Self {
        let start = Token::new(TokenKind::End, Span::new(1, 1), String::new());
        Self {
            lexer: Lexer::new(source),
            current: start.clone(),
            previous: start,
            panic_mode: false,
            code: Vec::new(),
            functions: HashMap::new(),
            global_names: Vec::new(),
            globals_closed: false,
            scopes: Vec::new(),
            loops: Vec::new(),
            jump_barrier: 0,
        }
    }

    fn finish(mut self) -> Result<ProgramInfo, Diagnostics> {
        let unresolved = self
            .code
            .iter()
            .position(|instr| instr.op.is_jump() && instr.count() == UNPATCHED);
        if let Some(at) = unresolved {
            if !self.lexer.diagnostics().had_error() {
                let err = ErrorKind::InvalidProgram(format!("unresolved jump at {:04}", at));
                self.lexer
                    .diagnostics_mut()
                    .raise_runtime_error(err.into());
            }
        }

        let Compiler {
            lexer,
            code,
            functions,
            global_names,
            ..
        } = self;
        let diagnostics = lexer.into_diagnostics();

        if diagnostics.had_error() {
            debug!("compilation failed with {} error(s)", diagnostics.error_count());
            return Err(diagnostics);
        }

        debug!(
            "compiled {} instruction(s), {} function(s), {} global(s)",
            code.len(),
            functions.len() - 1,
            global_names.len()
        );
        Ok(ProgramInfo {
            code: code.into(),
            functions,
            global_names,
            globals: HashMap::new(),
            diagnostics,
        })
    }

    // ==================== Declarations ====================

    fn program(&mut self) {
        // Global initializers always live at address 0
        self.functions
            .insert(REGGLOBAL.to_string(), FuncInfo { arity: 0, address: 0 });

        while !self.check(&TokenKind::End) {
            match self.current.kind {
                TokenKind::Var => self.global_declaration(),
                TokenKind::Func => {
                    self.close_globals();
                    self.function_declaration();
                }
                _ => {
                    self.error_at_current(ErrorKind::StatementOutsideFunction);
                    self.advance();
                }
            }
            if self.panic_mode {
                self.synchronize_top_level();
            }
        }

        self.close_globals();
        if self.functions.len() == 1 {
            self.error_at_current(ErrorKind::NoFunctions);
        }
    }

    fn close_globals(&mut self) {
        if !self.globals_closed {
            self.emit_push(Value::Null);
            self.emit_op(OpCode::Return);
            self.globals_closed = true;
        }
    }

    fn global_declaration(&mut self) {
        self.advance();
        let span = self.current.span;
        let name = self.consume_identifier("global name");

        if self.match_token(&TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_push(Value::Null);
        }
        self.consume(TokenKind::Semicolon, "';' after global declaration");

        let Some(name) = name else { return };
        if self.globals_closed {
            self.error_at(span, ErrorKind::GlobalAfterFunction(name.clone()));
        } else if self.global_names.contains(&name) {
            self.error_at(span, ErrorKind::DuplicateDeclaration(name.clone()));
        } else {
            self.global_names.push(name.clone());
        }
        self.emit_with(OpCode::SetGlobal, Operand::Name(name));
        self.emit_with(OpCode::Pop, Operand::Count(1));
    }

    fn function_declaration(&mut self) {
        self.advance();
        let name_span = self.current.span;
        let Some(name) = self.consume_identifier("function name") else {
            return;
        };

        let address = self.code.len();
        self.jump_barrier = address;
        self.begin_scope();

        let mut arity = 0;
        self.consume(TokenKind::LeftParen, "'(' after function name");
        if !self.check(&TokenKind::RightParen) {
            loop {
                let span = self.current.span;
                match self.consume_identifier("parameter name") {
                    Some(param) => {
                        self.declare_local(param, span);
                        arity += 1;
                    }
                    None => break,
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after parameters");

        if self.functions.contains_key(&name) {
            self.error_at(name_span, ErrorKind::DuplicateDeclaration(name.clone()));
        } else {
            self.functions
                .insert(name.clone(), FuncInfo { arity, address });
        }

        if self.consume(TokenKind::LeftBrace, "'{' before function body") {
            self.block();
        }

        // Falling off the end returns null
        self.emit_push(Value::Null);
        self.emit_op(OpCode::Return);

        self.scopes.clear();
        self.loops.clear();
        trace!("function '{}' ({} params) at {:04}", name, arity, address);
    }

    // ==================== Statements ====================

    fn block(&mut self) {
        self.begin_scope();
        while !self.check(&TokenKind::RightBrace)
            && !self.check(&TokenKind::End)
            && !self.check(&TokenKind::Func)
        {
            self.statement();
            if self.panic_mode {
                self.synchronize();
            }
        }
        self.consume(TokenKind::RightBrace, "'}' after block");
        self.end_scope();
    }

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::Var => self.var_declaration(),
            TokenKind::Return => self.return_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::LeftBrace => {
                self.advance();
                self.block();
            }
            _ => self.expression_statement(),
        }
    }

    fn var_declaration(&mut self) {
        self.advance();
        let span = self.current.span;
        let name = self.consume_identifier("variable name");

        // The initializer's value becomes the local's slot
        if self.match_token(&TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_push(Value::Null);
        }
        self.consume(TokenKind::Semicolon, "';' after variable declaration");

        if let Some(name) = name {
            self.declare_local(name, span);
        }
    }

    fn return_statement(&mut self) {
        self.advance();
        if self.check(&TokenKind::Semicolon) {
            self.emit_push(Value::Null);
        } else {
            self.expression();
        }
        self.consume(TokenKind::Semicolon, "';' after return value");
        self.emit_op(OpCode::Return);
    }

    fn if_statement(&mut self) {
        self.advance();
        self.expression();
        let then_jump = self.emit_jump(OpCode::Jfz);

        if self.consume(TokenKind::LeftBrace, "'{' after condition") {
            self.block();
        }

        if self.match_token(&TokenKind::Else) {
            let else_jump = self.emit_jump(OpCode::Jmp);
            self.patch_jump(then_jump);
            if self.check(&TokenKind::If) {
                self.if_statement();
            } else if self.consume(TokenKind::LeftBrace, "'{' after else") {
                self.block();
            }
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
    }

    fn while_statement(&mut self) {
        self.advance();
        let top = self.bind_label();
        self.expression();
        let exit = self.emit_jump(OpCode::Jfz);

        self.loops.push(LoopContext {
            top,
            depth: self.scopes.len(),
            breaks: Vec::new(),
        });
        if self.consume(TokenKind::LeftBrace, "'{' after condition") {
            self.block();
        }
        self.emit_loop(top);

        self.patch_jump(exit);
        if let Some(ctx) = self.loops.pop() {
            for jump in ctx.breaks {
                self.patch_jump(jump);
            }
        }
    }

    /// `for x in e { }` drives the enumerator protocol:
    /// `GetEnumerator` once, then `MoveNext` / `Current` per iteration
    fn for_statement(&mut self) {
        self.advance();
        let var_span = self.current.span;
        let name = self.consume_identifier("loop variable");
        self.consume(TokenKind::In, "'in' after loop variable");

        // Outer scope: the enumerator
        self.begin_scope();
        self.expression();
        self.emit_with(OpCode::PrepCall, Operand::None);
        self.emit_with(OpCode::ExtInstCall, Operand::Name("GetEnumerator".to_string()));
        self.declare_local(ENUMERATOR_LOCAL.to_string(), var_span);

        let top = self.bind_label();
        self.emit_with(OpCode::Dup, Operand::Count(1));
        self.emit_with(OpCode::PrepCall, Operand::None);
        self.emit_with(OpCode::ExtInstCall, Operand::Name("MoveNext".to_string()));
        let exit = self.emit_jump(OpCode::Jfz);

        self.loops.push(LoopContext {
            top,
            depth: self.scopes.len(),
            breaks: Vec::new(),
        });

        // Inner scope: the loop variable
        self.begin_scope();
        self.emit_with(OpCode::Dup, Operand::Count(1));
        self.emit_with(OpCode::PushInstField, Operand::Name("Current".to_string()));
        if let Some(name) = name {
            self.declare_local(name, var_span);
        }
        if self.consume(TokenKind::LeftBrace, "'{' after for clause") {
            self.block();
        }
        self.end_scope();
        self.emit_loop(top);

        self.patch_jump(exit);
        if let Some(ctx) = self.loops.pop() {
            for jump in ctx.breaks {
                self.patch_jump(jump);
            }
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        let span = self.current.span;
        self.advance();
        self.consume(TokenKind::Semicolon, "';' after break");

        let Some(depth) = self.loops.last().map(|ctx| ctx.depth) else {
            self.error_at(span, ErrorKind::BreakOutsideLoop);
            return;
        };
        self.unwind_to(depth);
        let jump = self.emit_jump(OpCode::Jmp);
        if let Some(ctx) = self.loops.last_mut() {
            ctx.breaks.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        let span = self.current.span;
        self.advance();
        self.consume(TokenKind::Semicolon, "';' after continue");

        let Some((depth, top)) = self.loops.last().map(|ctx| (ctx.depth, ctx.top)) else {
            self.error_at(span, ErrorKind::ContinueOutsideLoop);
            return;
        };
        self.unwind_to(depth);
        self.emit_loop(top);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "';' after expression");
        self.emit_with(OpCode::Pop, Operand::Count(1));
    }

    // ==================== Expressions ====================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        let Some(prefix) = Self::rule(&self.current.kind).prefix else {
            let got = self.current.kind.to_string();
            // A token that closes a statement or block means the expression is
            // missing; anything else is a stray token and gets skipped
            if matches!(
                self.current.kind,
                TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::End
            ) {
                self.error_at_current(ErrorKind::ExpectedExpression(got));
            } else {
                self.error_at_current(ErrorKind::UnexpectedToken(got));
                self.advance();
            }
            return;
        };
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(&self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(&self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && (self.check(&TokenKind::Equal) || self.current.kind.is_compound_assign()) {
            self.error_at_current(ErrorKind::InvalidAssignmentTarget);
            self.advance();
        }
    }

    fn rule(kind: &TokenKind) -> ParseRule<'a> {
        match kind {
            TokenKind::Int(_)
            | TokenKind::Float(_)
            | TokenKind::String(_)
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Null => ParseRule::new(Some(Self::literal), None, Precedence::None),
            TokenKind::Identifier(_) => ParseRule::new(Some(Self::variable), None, Precedence::None),
            TokenKind::ClassIdentifier(_) => {
                ParseRule::new(Some(Self::static_member), None, Precedence::None)
            }
            TokenKind::New => ParseRule::new(Some(Self::new_instance), None, Precedence::None),
            TokenKind::LeftParen => ParseRule::new(Some(Self::grouping), None, Precedence::None),
            TokenKind::LeftBracket => ParseRule::new(
                Some(Self::array_literal),
                Some(Self::subscript),
                Precedence::Subscript,
            ),
            TokenKind::Colon => ParseRule::new(None, Some(Self::member), Precedence::Member),
            TokenKind::Bang => ParseRule::new(Some(Self::unary), None, Precedence::None),
            TokenKind::Minus => ParseRule::new(Some(Self::unary), Some(Self::binary), Precedence::Term),
            TokenKind::Plus => ParseRule::new(None, Some(Self::binary), Precedence::Term),
            TokenKind::Star | TokenKind::Slash => {
                ParseRule::new(None, Some(Self::binary), Precedence::Factor)
            }
            TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => ParseRule::new(None, Some(Self::binary), Precedence::Comparison),
            TokenKind::AndAnd => ParseRule::new(None, Some(Self::and), Precedence::And),
            TokenKind::OrOr => ParseRule::new(None, Some(Self::or), Precedence::Or),
            _ => ParseRule::new(None, None, Precedence::None),
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        let value = match &self.previous.kind {
            TokenKind::Int(n) => Value::Int(*n),
            TokenKind::Float(n) => Value::Float(*n),
            TokenKind::String(s) => Value::String(s.clone()),
            TokenKind::True => Value::Bool(true),
            TokenKind::False => Value::Bool(false),
            _ => Value::Null,
        };
        self.emit_push(value);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Minus => {
                // -x is 0 - x
                self.emit_push(Value::Int(0));
                self.parse_precedence(Precedence::Unary);
                self.emit_op(OpCode::Sub);
            }
            _ => {
                self.parse_precedence(Precedence::Unary);
                self.emit_op(OpCode::Inv);
            }
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        let precedence = Self::rule(&operator).precedence;
        self.parse_precedence(precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Sub),
            TokenKind::Star => self.emit_op(OpCode::Mult),
            TokenKind::Slash => self.emit_op(OpCode::Div),
            TokenKind::Less => self.emit_op(OpCode::Lss),
            TokenKind::Greater => self.emit_op(OpCode::Grt),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equ),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Grt);
                self.emit_op(OpCode::Inv);
            }
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Lss);
                self.emit_op(OpCode::Inv);
            }
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equ);
                self.emit_op(OpCode::Inv);
            }
            _ => {}
        }
    }

    fn and(&mut self, _can_assign: bool) {
        self.emit_with(OpCode::Dup, Operand::Count(1));
        let end = self.emit_jump(OpCode::Jfz);
        self.emit_with(OpCode::Pop, Operand::Count(1));
        self.parse_precedence(Precedence::And.next());
        self.patch_jump(end);
    }

    fn or(&mut self, _can_assign: bool) {
        self.emit_with(OpCode::Dup, Operand::Count(1));
        let end = self.emit_jump(OpCode::Jnz);
        self.emit_with(OpCode::Pop, Operand::Count(1));
        self.parse_precedence(Precedence::Or.next());
        self.patch_jump(end);
    }

    fn variable(&mut self, can_assign: bool) {
        let TokenKind::Identifier(name) = self.previous.kind.clone() else {
            return;
        };

        if self.match_token(&TokenKind::LeftParen) {
            self.emit_with(OpCode::PrepCall, Operand::None);
            self.arguments();
            self.emit_with(OpCode::Call, Operand::Name(name));
            return;
        }

        let read = match self.resolve_local(&name) {
            Some(slot) => (OpCode::PushLocal, Operand::Slot(slot)),
            None => (OpCode::PushGlobal, Operand::Name(name)),
        };
        self.read_or_assign(read, 0, can_assign);
    }

    /// `Class:member` and `Class:member(args)`
    fn static_member(&mut self, can_assign: bool) {
        let TokenKind::ClassIdentifier(class) = self.previous.kind.clone() else {
            return;
        };
        if !self.consume(TokenKind::Colon, "':' after class name") {
            return;
        }
        let Some(member) = self.consume_member_name() else {
            return;
        };
        let qualified = format!("{}.{}", class, member);

        if self.match_token(&TokenKind::LeftParen) {
            self.emit_with(OpCode::PrepCall, Operand::None);
            self.arguments();
            self.emit_with(OpCode::ExtStaticCall, Operand::Name(qualified));
        } else {
            self.read_or_assign((OpCode::PushStaticField, Operand::Name(qualified)), 0, can_assign);
        }
    }

    /// `receiver:member` and `receiver:member(args)`
    fn member(&mut self, can_assign: bool) {
        let Some(member) = self.consume_member_name() else {
            return;
        };

        if self.match_token(&TokenKind::LeftParen) {
            self.emit_with(OpCode::PrepCall, Operand::None);
            self.arguments();
            self.emit_with(OpCode::ExtInstCall, Operand::Name(member));
        } else {
            self.read_or_assign((OpCode::PushInstField, Operand::Name(member)), 1, can_assign);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "']' after index");
        self.read_or_assign((OpCode::PushArr, Operand::None), 2, can_assign);
    }

    fn new_instance(&mut self, _can_assign: bool) {
        let TokenKind::ClassIdentifier(class) = self.current.kind.clone() else {
            let got = self.current.kind.to_string();
            self.error_at_current(ErrorKind::ExpectedToken("class name after 'new'".to_string(), got));
            return;
        };
        self.advance();
        if !self.consume(TokenKind::LeftParen, "'(' after class name") {
            return;
        }
        self.emit_with(OpCode::PrepCall, Operand::None);
        self.arguments();
        self.emit_with(OpCode::ExtCtor, Operand::Name(class));
    }

    fn array_literal(&mut self, _can_assign: bool) {
        self.emit_with(OpCode::PrepCall, Operand::None);
        if !self.check(&TokenKind::RightBracket) {
            loop {
                self.expression();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "']' after array elements");
        self.emit_with(OpCode::CrtArr, Operand::None);
    }

    /// Comma-separated arguments up to and including `)`
    fn arguments(&mut self) {
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "')' after arguments");
    }

    /// Emit an lvalue read, or the matching store when an assignment follows.
    /// `operands` is how many values the read consumes (receiver, index).
    fn read_or_assign(&mut self, read: (OpCode, Operand), operands: usize, can_assign: bool) {
        let (op, operand) = read;
        let Some(setter) = op.setter() else {
            self.emit_with(op, operand);
            return;
        };

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_with(setter, operand);
        } else if can_assign && self.current.kind.is_compound_assign() {
            let arithmetic = match self.current.kind {
                TokenKind::PlusEqual => OpCode::Add,
                TokenKind::MinusEqual => OpCode::Sub,
                TokenKind::StarEqual => OpCode::Mult,
                _ => OpCode::Div,
            };
            self.advance();

            if operands > 0 {
                self.emit_with(OpCode::Dup, Operand::Count(operands));
            }
            self.emit_with(op, operand.clone());
            self.expression();
            self.emit_op(arithmetic);

            let store = if op == OpCode::PushArr {
                OpCode::SetArrCached
            } else {
                setter
            };
            self.emit_with(store, operand);
        } else {
            self.emit_with(op, operand);
        }
    }

    // ==================== Scopes ====================

    fn begin_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    fn end_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            if !scope.names.is_empty() {
                self.emit_with(OpCode::Pop, Operand::Count(scope.names.len()));
            }
        }
    }

    fn declare_local(&mut self, name: String, span: Span) {
        let duplicate = self
            .scopes
            .last()
            .map_or(false, |scope| scope.names.contains(&name));
        if duplicate {
            self.error_at(span, ErrorKind::DuplicateDeclaration(name.clone()));
        }
        // Declared even when duplicated so slots stay in step with the stack
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.push(name);
        }
    }

    /// Slot of the innermost local with this name, counted from the frame base
    fn resolve_local(&self, name: &str) -> Option<usize> {
        let mut end: usize = self.scopes.iter().map(|s| s.names.len()).sum();
        for scope in self.scopes.iter().rev() {
            let start = end - scope.names.len();
            if let Some(index) = scope.names.iter().rposition(|n| n == name) {
                return Some(start + index);
            }
            end = start;
        }
        None
    }

    /// Pop the locals of every scope at or above `depth`, leaving the
    /// compile-time scopes in place
    fn unwind_to(&mut self, depth: usize) {
        let count: usize = self.scopes[depth.min(self.scopes.len())..]
            .iter()
            .map(|s| s.names.len())
            .sum();
        if count > 0 {
            self.emit_with(OpCode::Pop, Operand::Count(count));
        }
    }

    // ==================== Emission ====================

    fn line(&self) -> usize {
        self.previous.span.line
    }

    fn emit(&mut self, instr: Instruction) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn emit_with(&mut self, op: OpCode, operand: Operand) -> usize {
        let line = self.line();
        self.emit(Instruction::new(op, operand, line))
    }

    fn emit_push(&mut self, value: Value) {
        let line = self.line();
        self.emit(Instruction::push(value, line));
    }

    /// Emit an operator, folding it into its literal operands when possible
    fn emit_op(&mut self, op: OpCode) {
        if op.is_foldable() && self.fold_binary(op) {
            return;
        }
        if op == OpCode::Inv && self.fold_invert() {
            return;
        }
        self.emit_with(op, Operand::None);
    }

    fn fold_binary(&mut self, op: OpCode) -> bool {
        let len = self.code.len();
        if len < 2 || self.jump_barrier > len - 2 {
            return false;
        }
        let (Some(a), Some(b)) = (self.code[len - 2].literal(), self.code[len - 1].literal()) else {
            return false;
        };

        let line = self.line();
        let trial = vec![
            Instruction::push(a.clone(), line),
            Instruction::push(b.clone(), line),
            Instruction::simple(op, line),
            Instruction::simple(OpCode::Return, line),
        ];
        match Interpreter::evaluate(trial) {
            Ok(value) => {
                trace!("folded {:?} {} {:?} into {:?}", a, op.mnemonic(), b, value);
                self.code.truncate(len - 2);
                self.emit(Instruction::push(value, line));
                true
            }
            Err(err) => {
                self.error_at_previous(ErrorKind::ConstantFold(err.kind.to_string()));
                false
            }
        }
    }

    fn fold_invert(&mut self) -> bool {
        let len = self.code.len();
        if len < 1 || self.jump_barrier > len - 1 {
            return false;
        }
        let Some(literal) = self.code[len - 1].literal() else {
            return false;
        };
        match literal.invert() {
            Ok(value) => {
                let line = self.code[len - 1].line;
                self.code[len - 1] = Instruction::push(value, line);
                true
            }
            Err(kind) => {
                self.error_at_previous(ErrorKind::ConstantFold(kind.to_string()));
                false
            }
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_with(op, Operand::Address(UNPATCHED))
    }

    /// Point a forward jump at the next instruction to be emitted
    fn patch_jump(&mut self, at: usize) {
        let target = self.code.len();
        if let Some(instr) = self.code.get_mut(at) {
            instr.operand = Operand::Address(target);
        }
        self.jump_barrier = target;
    }

    /// Mark the next instruction as a backward jump target
    fn bind_label(&mut self) -> usize {
        self.jump_barrier = self.code.len();
        self.code.len()
    }

    fn emit_loop(&mut self, top: usize) {
        self.emit_with(OpCode::Jmp, Operand::Address(top));
    }

    // ==================== Tokens ====================

    fn advance(&mut self) {
        // Bad tokens were already reported by the lexer
        let next = loop {
            let token = self.lexer.next_token();
            if token.kind != TokenKind::Error {
                break token;
            }
        };
        self.previous = std::mem::replace(&mut self.current, next);
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.current.kind == *kind
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, expected: &str) -> bool {
        if self.check(&kind) {
            self.advance();
            return true;
        }
        let got = self.current.kind.to_string();
        self.error_at_current(ErrorKind::ExpectedToken(expected.to_string(), got));
        false
    }

    fn consume_identifier(&mut self, expected: &str) -> Option<String> {
        if let TokenKind::Identifier(name) = &self.current.kind {
            let name = name.clone();
            self.advance();
            return Some(name);
        }
        let got = self.current.kind.to_string();
        self.error_at_current(ErrorKind::ExpectedToken(expected.to_string(), got));
        None
    }

    /// Member names may be capitalised (`xs:Count`)
    fn consume_member_name(&mut self) -> Option<String> {
        match &self.current.kind {
            TokenKind::Identifier(name) | TokenKind::ClassIdentifier(name) => {
                let name = name.clone();
                self.advance();
                Some(name)
            }
            _ => {
                let got = self.current.kind.to_string();
                self.error_at_current(ErrorKind::ExpectedToken("member name after ':'".to_string(), got));
                None
            }
        }
    }

    // ==================== Errors ====================

    fn error_at(&mut self, span: Span, kind: ErrorKind) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.lexer.diagnostics_mut().raise_syntax_error(kind, span);
    }

    fn error_at_current(&mut self, kind: ErrorKind) {
        self.error_at(self.current.span, kind);
    }

    fn error_at_previous(&mut self, kind: ErrorKind) {
        self.error_at(self.previous.span, kind);
    }

    /// Skip to a statement boundary after an error inside a function
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while !self.check(&TokenKind::End) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Var
                | TokenKind::Func
                | TokenKind::Return
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::RightBrace => return,
                _ => {}
            }
            self.advance();
        }
    }

    /// Skip to the next top-level declaration
    fn synchronize_top_level(&mut self) {
        self.panic_mode = false;
        while !matches!(
            self.current.kind,
            TokenKind::End | TokenKind::Func | TokenKind::Var
        ) {
            self.advance();
        }
    }
}
