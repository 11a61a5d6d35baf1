//! Parser for the map-function dialect.
//!
//! Parses token streams into a [`FunctionDef`]. Semicolons are optional
//! everywhere a statement may end.
//!
//! Nesting is bounded by [`MAX_NESTING`] twice over: brackets and braceless
//! statement chains are counted on the token stream before parsing, and
//! operator chains are measured as they are folded into the tree.

use chumsky::prelude::*;
use chumsky::{BoxedParser, Stream};
use std::sync::Arc;

use super::ast::{AssignOp, BinaryOp, Expr, FunctionDef, IterKind, Stmt, UnaryOp, MAX_NESTING};
use super::lexer::{number_value, tokenize, Span, SyntaxError, Token};
use super::value::format_number;

/// Stack for the parsing thread; recursion is bounded by `MAX_NESTING`
const PARSE_STACK_SIZE: usize = 64 << 20;

type StmtParser = Recursive<'static, Token, Stmt, Simple<Token>>;
type ExprParser = BoxedParser<'static, Token, Expr, Simple<Token>>;

/// Parse source that must consist of exactly one function expression.
pub fn parse_map_function(source: &str) -> Result<FunctionDef, SyntaxError> {
    let tokens = tokenize(source)?;
    check_nesting(source, &tokens)?;

    let len = source.chars().count();
    let parsed = std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("cushion-parse".into())
            .stack_size(PARSE_STACK_SIZE)
            .spawn_scoped(scope, move || {
                parser().parse(Stream::from_iter(len..len + 1, tokens.into_iter()))
            })
            .map(|handle| handle.join())
    });

    match parsed {
        Ok(Ok(result)) => result.map_err(|errs| match errs.first() {
            Some(err) => SyntaxError::from_simple(source, err),
            None => SyntaxError::new(source, 0, "invalid source"),
        }),
        Ok(Err(panic)) => std::panic::resume_unwind(panic),
        Err(err) => Err(SyntaxError::new(
            source,
            0,
            format!("failed to start parser thread: {err}"),
        )),
    }
}

fn nesting_message() -> String {
    format!("nesting exceeds {MAX_NESTING} levels")
}

/// Reject sources whose brackets or braceless `if`/`while`/`for` chains
/// nest deeper than `MAX_NESTING`.
fn check_nesting(source: &str, tokens: &[(Token, Span)]) -> Result<(), SyntaxError> {
    enum Open {
        Paren { header: bool },
        Bracket,
        Brace,
        Ternary,
    }

    // Each entry remembers the braceless run it interrupted
    let mut stack: Vec<(Open, usize)> = Vec::new();
    let mut base = 0;
    let mut run = 0;
    let mut prev: Option<&Token> = None;
    let mut after_header = false;

    for (tok, span) in tokens {
        let follows_header = std::mem::take(&mut after_header);
        let opened = match tok {
            Token::If | Token::While | Token::For => {
                if follows_header || prev == Some(&Token::Else) {
                    run += 1;
                } else {
                    run = 0;
                }
                None
            }
            Token::LParen => Some(Open::Paren {
                header: matches!(prev, Some(Token::If | Token::While | Token::For)),
            }),
            Token::LBracket => Some(Open::Bracket),
            Token::LBrace => Some(Open::Brace),
            Token::Question => Some(Open::Ternary),
            Token::Colon => {
                if matches!(stack.last(), Some((Open::Ternary, _))) {
                    if let Some((_, saved)) = stack.pop() {
                        base -= 1 + saved;
                        run = saved;
                    }
                }
                None
            }
            Token::RParen | Token::RBracket | Token::RBrace => {
                while let Some((open, saved)) = stack.pop() {
                    base -= 1 + saved;
                    run = saved;
                    match open {
                        Open::Ternary => continue,
                        Open::Paren { header } => after_header = header,
                        Open::Bracket | Open::Brace => {}
                    }
                    break;
                }
                None
            }
            _ => None,
        };

        if let Some(open) = opened {
            stack.push((open, run));
            base += 1 + run;
            run = 0;
        }
        if base + run > MAX_NESTING {
            return Err(SyntaxError::new(source, span.start, nesting_message()));
        }
        prev = Some(tok);
    }
    Ok(())
}

/// Create a parser for a complete map function
fn parser() -> impl Parser<Token, FunctionDef, Error = Simple<Token>> {
    let mut stmt: StmtParser = Recursive::declare();
    let expr = expression(stmt.clone());

    let semi = just(Token::Semicolon).or_not();
    let decl_kw = choice((just(Token::Var), just(Token::Let), just(Token::Const)));
    let paren_expr = expr
        .clone()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let declaration = decl_kw
        .clone()
        .ignore_then(
            ident()
                .then(just(Token::Assign).ignore_then(expr.clone()).or_not())
                .separated_by(just(Token::Comma))
                .at_least(1),
        )
        .map(Stmt::Decl);

    let block = stmt
        .clone()
        .repeated()
        .delimited_by(just(Token::LBrace), just(Token::RBrace))
        .map(Stmt::Block);

    let function_decl = just(Token::Function)
        .ignore_then(function_rest(stmt.clone()))
        .try_map(|def, span| match def.name.clone() {
            Some(name) => Ok(Stmt::Decl(vec![(name, Some(Expr::Function(Arc::new(def))))])),
            None => Err(Simple::custom(span, "function statement requires a name")),
        });

    let if_stmt = just(Token::If)
        .ignore_then(paren_expr.clone())
        .then(stmt.clone())
        .then(just(Token::Else).ignore_then(stmt.clone()).or_not())
        .map(|((cond, then), otherwise)| Stmt::If {
            cond,
            then: Box::new(then),
            otherwise: otherwise.map(Box::new),
        });

    let while_stmt = just(Token::While)
        .ignore_then(paren_expr)
        .then(stmt.clone())
        .map(|(cond, body)| Stmt::While {
            cond,
            body: Box::new(body),
        });

    // for (x in obj) / for (var x of arr)
    let iter_kind = filter_map(|span, tok: Token| match tok {
        Token::In => Ok(IterKind::Keys),
        Token::Ident(word) if word == "of" => Ok(IterKind::Values),
        tok => Err(Simple::expected_input_found(span, None, Some(tok))),
    });
    let for_each = just(Token::For)
        .ignore_then(
            decl_kw
                .or_not()
                .ignore_then(ident())
                .then(iter_kind)
                .then(expr.clone())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(stmt.clone())
        .map(|(((binding, kind), iterable), body)| Stmt::ForEach {
            binding,
            kind,
            iterable,
            body: Box::new(body),
        });

    let for_init = declaration
        .clone()
        .or(expr.clone().map(Stmt::Expr))
        .map(Box::new)
        .or_not();
    let classic_for = just(Token::For)
        .ignore_then(
            for_init
                .then_ignore(just(Token::Semicolon))
                .then(expr.clone().or_not())
                .then_ignore(just(Token::Semicolon))
                .then(expr.clone().or_not())
                .delimited_by(just(Token::LParen), just(Token::RParen)),
        )
        .then(stmt.clone())
        .map(|(((init, cond), update), body)| Stmt::For {
            init,
            cond,
            update,
            body: Box::new(body),
        });

    let return_stmt = just(Token::Return)
        .ignore_then(expr.clone().or_not())
        .then_ignore(semi.clone())
        .map(Stmt::Return);
    let break_stmt = just(Token::Break).then_ignore(semi.clone()).to(Stmt::Break);
    let continue_stmt = just(Token::Continue)
        .then_ignore(semi.clone())
        .to(Stmt::Continue);
    let throw_stmt = just(Token::Throw)
        .ignore_then(expr.clone())
        .then_ignore(semi.clone())
        .map(Stmt::Throw);

    stmt.define(choice((
        block,
        just(Token::Semicolon).to(Stmt::Empty),
        declaration.then_ignore(semi.clone()),
        function_decl,
        if_stmt,
        while_stmt,
        for_each,
        classic_for,
        return_stmt,
        break_stmt,
        continue_stmt,
        throw_stmt,
        expr.then_ignore(semi).map(Stmt::Expr),
    )));

    just(Token::Function)
        .labelled("a function definition")
        .ignore_then(function_rest(stmt))
        .then_ignore(just(Token::Semicolon).repeated())
        .then_ignore(end())
}

// ============================================================================
// Helpers
// ============================================================================

fn ident() -> impl Parser<Token, String, Error = Simple<Token>> + Clone {
    select! { Token::Ident(name) => name }.labelled("an identifier")
}

/// Property names accept keywords as well as identifiers (`doc.default`)
fn property_name() -> impl Parser<Token, String, Error = Simple<Token>> + Clone {
    filter_map(|span, tok: Token| match tok {
        Token::Ident(name) => Ok(name),
        tok => match tok.keyword() {
            Some(kw) => Ok(kw.to_string()),
            None => Err(Simple::expected_input_found(span, None, Some(tok))),
        },
    })
    .labelled("a property name")
}

/// After the `function` keyword: optional name, params, body
fn function_rest(
    stmt: StmtParser,
) -> impl Parser<Token, FunctionDef, Error = Simple<Token>> + Clone {
    let params = ident()
        .separated_by(just(Token::Comma))
        .delimited_by(just(Token::LParen), just(Token::RParen));
    let body = stmt
        .repeated()
        .delimited_by(just(Token::LBrace), just(Token::RBrace));

    ident()
        .or_not()
        .then(params)
        .then(body)
        .map(|((name, params), body)| FunctionDef { name, params, body })
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Clone, Copy)]
enum Infix {
    Binary(BinaryOp),
    And,
    Or,
}

impl Infix {
    fn apply(self, lhs: Expr, rhs: Expr) -> Expr {
        let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
        match self {
            Infix::Binary(op) => Expr::Binary(op, lhs, rhs),
            Infix::And => Expr::And(lhs, rhs),
            Infix::Or => Expr::Or(lhs, rhs),
        }
    }
}

enum Suffix {
    Member(String),
    Index(Expr),
    Call(Vec<Expr>),
}

#[derive(Clone, Copy)]
enum Prefix {
    Op(UnaryOp),
    Update(f64),
}

fn expression(stmt: StmtParser) -> ExprParser {
    recursive(move |expr| {
        let expr = expr.boxed();

        let number = select! { Token::Number(text) => text }.try_map(|text, span| {
            number_value(&text)
                .map(Expr::Number)
                .ok_or_else(|| Simple::custom(span, format!("invalid number '{text}'")))
        });
        let literal = select! {
            Token::Str(s) => Expr::Str(s),
            Token::True => Expr::Bool(true),
            Token::False => Expr::Bool(false),
            Token::Null => Expr::Null,
            Token::Ident(name) => Expr::Ident(name),
        };

        let array = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .try_map(|items, span| bounded(Expr::Array(items), span));

        let key = select! {
            Token::Str(s) => s,
            Token::Number(text) => number_value(&text).map(format_number).unwrap_or(text),
        }
        .or(property_name());
        let object = key
            .then_ignore(just(Token::Colon))
            .then(expr.clone())
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .delimited_by(just(Token::LBrace), just(Token::RBrace))
            .try_map(|entries, span| bounded(Expr::Object(entries), span));

        let function = just(Token::Function)
            .ignore_then(function_rest(stmt))
            .map(|def| Expr::Function(Arc::new(def)));

        let paren = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let atom = choice((number, literal, array, object, function, paren)).boxed();

        let suffix = choice((
            just(Token::Dot)
                .ignore_then(property_name())
                .map(Suffix::Member),
            expr.clone()
                .delimited_by(just(Token::LBracket), just(Token::RBracket))
                .map(Suffix::Index),
            expr.clone()
                .separated_by(just(Token::Comma))
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .map(Suffix::Call),
        ));
        let call = atom
            .then(suffix.repeated())
            .try_map(|(base, suffixes), span| fold_suffixes(base, suffixes, span));

        let postfix = call
            .then(select! { Token::PlusPlus => 1.0, Token::MinusMinus => -1.0 }.or_not())
            .try_map(|(target, delta), span| match delta {
                Some(delta) => update(target, delta, false, span),
                None => Ok(target),
            });

        let prefix = select! {
            Token::Bang => Prefix::Op(UnaryOp::Not),
            Token::Minus => Prefix::Op(UnaryOp::Neg),
            Token::Plus => Prefix::Op(UnaryOp::Plus),
            Token::Typeof => Prefix::Op(UnaryOp::Typeof),
            Token::PlusPlus => Prefix::Update(1.0),
            Token::MinusMinus => Prefix::Update(-1.0),
        };
        let unary = prefix
            .repeated()
            .then(postfix)
            .try_map(|(prefixes, operand), span| fold_prefixes(prefixes, operand, span))
            .boxed();

        let product = binary_level(
            unary,
            select! {
                Token::Star => Infix::Binary(BinaryOp::Mul),
                Token::Slash => Infix::Binary(BinaryOp::Div),
                Token::Percent => Infix::Binary(BinaryOp::Rem),
            },
        );
        let sum = binary_level(
            product,
            select! {
                Token::Plus => Infix::Binary(BinaryOp::Add),
                Token::Minus => Infix::Binary(BinaryOp::Sub),
            },
        );
        let comparison = binary_level(
            sum,
            select! {
                Token::Lt => Infix::Binary(BinaryOp::Lt),
                Token::Le => Infix::Binary(BinaryOp::Le),
                Token::Gt => Infix::Binary(BinaryOp::Gt),
                Token::Ge => Infix::Binary(BinaryOp::Ge),
            },
        );
        let equality = binary_level(
            comparison,
            select! {
                Token::EqEq => Infix::Binary(BinaryOp::LooseEq),
                Token::NotEq => Infix::Binary(BinaryOp::LooseNe),
                Token::EqEqEq => Infix::Binary(BinaryOp::StrictEq),
                Token::NotEqEq => Infix::Binary(BinaryOp::StrictNe),
            },
        );
        let and = binary_level(equality, just(Token::AndAnd).to(Infix::And));
        let or = binary_level(and, just(Token::OrOr).to(Infix::Or));

        // `a ? b : c ? d : e` is read as a flat chain and folded from the right
        let conditional = or
            .clone()
            .then(
                just(Token::Question)
                    .ignore_then(expr)
                    .then_ignore(just(Token::Colon))
                    .then(or)
                    .repeated(),
            )
            .try_map(|(first, branches), span| fold_conditional(first, branches, span))
            .boxed();

        let assign_op = select! {
            Token::Assign => AssignOp::Set,
            Token::PlusAssign => AssignOp::Add,
            Token::MinusAssign => AssignOp::Sub,
        };
        conditional
            .clone()
            .then(assign_op.then(conditional).repeated())
            .try_map(|(first, rest), span| fold_assignment(first, rest, span))
    })
    .boxed()
}

/// One left-associative precedence level
fn binary_level(
    operand: ExprParser,
    ops: impl Parser<Token, Infix, Error = Simple<Token>> + Clone + 'static,
) -> ExprParser {
    operand
        .clone()
        .then(ops.then(operand).repeated())
        .try_map(|(first, rest), span| fold_infix(first, rest, span))
        .boxed()
}

fn fold_infix(first: Expr, rest: Vec<(Infix, Expr)>, span: Span) -> Result<Expr, Simple<Token>> {
    if rest.is_empty() {
        return Ok(first);
    }
    let mut depth = expr_depth(&first);
    let mut lhs = first;
    for (op, rhs) in rest {
        depth = within_limit(depth.max(expr_depth(&rhs)) + 1, &span)?;
        lhs = op.apply(lhs, rhs);
    }
    Ok(lhs)
}

fn fold_suffixes(base: Expr, suffixes: Vec<Suffix>, span: Span) -> Result<Expr, Simple<Token>> {
    if suffixes.is_empty() {
        return Ok(base);
    }
    let mut depth = expr_depth(&base);
    let mut expr = base;
    for suffix in suffixes {
        let inner = match &suffix {
            Suffix::Member(_) => 0,
            Suffix::Index(index) => expr_depth(index),
            Suffix::Call(args) => args.iter().map(expr_depth).max().unwrap_or(0),
        };
        depth = within_limit(depth.max(inner) + 1, &span)?;
        let object = Box::new(expr);
        expr = match suffix {
            Suffix::Member(name) => Expr::Member(object, name),
            Suffix::Index(index) => Expr::Index(object, Box::new(index)),
            Suffix::Call(args) => Expr::Call(object, args),
        };
    }
    Ok(expr)
}

fn fold_prefixes(prefixes: Vec<Prefix>, operand: Expr, span: Span) -> Result<Expr, Simple<Token>> {
    if prefixes.is_empty() {
        return Ok(operand);
    }
    let mut depth = expr_depth(&operand);
    let mut expr = operand;
    for prefix in prefixes.into_iter().rev() {
        depth = within_limit(depth + 1, &span)?;
        expr = match prefix {
            Prefix::Op(op) => Expr::Unary(op, Box::new(expr)),
            Prefix::Update(delta) => update(expr, delta, true, span.clone())?,
        };
    }
    Ok(expr)
}

fn fold_conditional(
    first: Expr,
    branches: Vec<(Expr, Expr)>,
    span: Span,
) -> Result<Expr, Simple<Token>> {
    if branches.is_empty() {
        return Ok(first);
    }
    let mut pending = Vec::with_capacity(branches.len());
    let mut cond = first;
    for (then, next) in branches {
        pending.push((cond, then));
        cond = next;
    }

    let mut depth = expr_depth(&cond);
    let mut otherwise = cond;
    for (cond, then) in pending.into_iter().rev() {
        depth = within_limit(depth.max(expr_depth(&cond)).max(expr_depth(&then)) + 1, &span)?;
        otherwise = Expr::Conditional(Box::new(cond), Box::new(then), Box::new(otherwise));
    }
    Ok(otherwise)
}

/// `a = b += c` folds from the right
fn fold_assignment(
    first: Expr,
    rest: Vec<(AssignOp, Expr)>,
    span: Span,
) -> Result<Expr, Simple<Token>> {
    if rest.is_empty() {
        return Ok(first);
    }
    let mut targets = Vec::with_capacity(rest.len());
    let mut current = first;
    for (op, next) in rest {
        targets.push((current, op));
        current = next;
    }

    let mut depth = expr_depth(&current);
    let mut value = current;
    for (target, op) in targets.into_iter().rev() {
        check_target(&target, &span)?;
        depth = within_limit(depth.max(expr_depth(&target)) + 1, &span)?;
        value = Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        };
    }
    Ok(value)
}

fn update(target: Expr, delta: f64, prefix: bool, span: Span) -> Result<Expr, Simple<Token>> {
    check_target(&target, &span)?;
    Ok(Expr::Update {
        target: Box::new(target),
        delta,
        prefix,
    })
}

fn check_target(expr: &Expr, span: &Span) -> Result<(), Simple<Token>> {
    match expr {
        Expr::Ident(_) | Expr::Member(..) | Expr::Index(..) => Ok(()),
        _ => Err(Simple::custom(span.clone(), "invalid assignment target")),
    }
}

// ============================================================================
// Depth accounting
// ============================================================================

fn within_limit(depth: usize, span: &Span) -> Result<usize, Simple<Token>> {
    if depth > MAX_NESTING {
        Err(Simple::custom(span.clone(), nesting_message()))
    } else {
        Ok(depth)
    }
}

fn bounded(expr: Expr, span: Span) -> Result<Expr, Simple<Token>> {
    within_limit(expr_depth(&expr), &span)?;
    Ok(expr)
}

/// Height of an expression tree, counting nested function bodies
fn expr_depth(expr: &Expr) -> usize {
    let children = match expr {
        Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Null | Expr::Ident(_) => 0,
        Expr::Array(items) => items.iter().map(expr_depth).max().unwrap_or(0),
        Expr::Object(entries) => entries.iter().map(|(_, v)| expr_depth(v)).max().unwrap_or(0),
        Expr::Member(object, _) => expr_depth(object),
        Expr::Index(a, b) | Expr::Binary(_, a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
            expr_depth(a).max(expr_depth(b))
        }
        Expr::Call(callee, args) => args.iter().map(expr_depth).fold(expr_depth(callee), usize::max),
        Expr::Function(def) => body_depth(&def.body),
        Expr::Assign { target, value, .. } => expr_depth(target).max(expr_depth(value)),
        Expr::Update { target, .. } | Expr::Unary(_, target) => expr_depth(target),
        Expr::Conditional(a, b, c) => expr_depth(a).max(expr_depth(b)).max(expr_depth(c)),
    };
    children + 1
}

fn stmt_depth(stmt: &Stmt) -> usize {
    let opt = |expr: &Option<Expr>| expr.as_ref().map_or(0, expr_depth);
    let children = match stmt {
        Stmt::Decl(bindings) => bindings.iter().map(|(_, init)| opt(init)).max().unwrap_or(0),
        Stmt::Expr(expr) | Stmt::Throw(expr) => expr_depth(expr),
        Stmt::Block(body) => body_depth(body),
        Stmt::If {
            cond,
            then,
            otherwise,
        } => expr_depth(cond)
            .max(stmt_depth(then))
            .max(otherwise.as_deref().map_or(0, stmt_depth)),
        Stmt::While { cond, body } => expr_depth(cond).max(stmt_depth(body)),
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => init
            .as_deref()
            .map_or(0, stmt_depth)
            .max(opt(cond))
            .max(opt(update))
            .max(stmt_depth(body)),
        Stmt::ForEach { iterable, body, .. } => expr_depth(iterable).max(stmt_depth(body)),
        Stmt::Return(value) => opt(value),
        Stmt::Break | Stmt::Continue | Stmt::Empty => 0,
    };
    children + 1
}

fn body_depth(body: &[Stmt]) -> usize {
    body.iter().map(stmt_depth).max().unwrap_or(0)
}
