//! text.rs
//! Canonical prefix-notation text form of equation trees.
//!
//! Operators render fully parenthesized, `(+ Scalar(3.0) Scalar(2.0))`;
//! constants and distributions render as constructor calls, `Scalar([1,2,3])`,
//! `Normal(0.0, 1.0)`; references render as their bare name and history views
//! as `(timeseries name)`. `parse(render(tree))` rebuilds the same tree.
//!
//! A constructor is recognized by an opening parenthesis glued to its name;
//! `Scalar (1)` is not a constructor call.

use super::composite::{Composite, CompositeKind};
use super::distribution::{DistKind, Distribution};
use super::error::{GraphError, ParseError};
use super::node::{Constant, Expr, Operation};
use crate::compute::value::Dtype;
use crate::store::RefId;
use std::fmt::Write;

/// Resolves reference ids to names and back.
pub trait NameLookup {
    fn name_of_id(&self, id: RefId) -> Option<&str>;
    fn id_of_name(&self, name: &str) -> Option<RefId>;
}

// --- Rendering ---

pub fn render(expr: &Expr, names: &impl NameLookup) -> String {
    let mut out = String::new();
    render_into(&mut out, expr, names);
    out
}

fn render_into(out: &mut String, expr: &Expr, names: &impl NameLookup) {
    match expr {
        Expr::Constant(c) => render_constant(out, c),
        Expr::Reference(id) => out.push_str(&ref_name(*id, names)),
        Expr::Timeseries(id) => {
            let _ = write!(out, "(timeseries {})", ref_name(*id, names));
        }
        Expr::Distribution(d) => render_distribution(out, d),
        Expr::Operator { op, children } => render_call(out, op.symbol(), children, names),
        Expr::Composite(c) => render_call(out, c.kind.symbol(), &c.inputs, names),
    }
}

fn render_call(out: &mut String, head: &str, children: &[Expr], names: &impl NameLookup) {
    out.push('(');
    out.push_str(head);
    for child in children {
        out.push(' ');
        render_into(out, child, names);
    }
    out.push(')');
}

fn ref_name(id: RefId, names: &impl NameLookup) -> String {
    names.name_of_id(id).map(str::to_string).unwrap_or_else(|| format!("#{}", id.0))
}

fn format_number(value: f64, dtype: Dtype) -> String {
    match dtype {
        Dtype::Bool => (value != 0.0).to_string(),
        Dtype::Int => (value as i64).to_string(),
        Dtype::Float => format!("{:?}", value),
    }
}

fn format_list(values: &[f64], dtype: Dtype) -> String {
    let items: Vec<String> = values.iter().map(|v| format_number(*v, dtype)).collect();
    format!("[{}]", items.join(","))
}

fn render_constant(out: &mut String, c: &Constant) {
    let body = match c {
        Constant::Scalar { value, dtype } => format_number(*value, *dtype),
        Constant::Vector { values, dtype } => format_list(values, *dtype),
    };
    let _ = write!(out, "Scalar({})", body);
}

fn render_distribution(out: &mut String, d: &Distribution) {
    let args = match &d.kind {
        DistKind::Normal { mean, std } => format!("{:?}, {:?}", mean, std),
        DistKind::Uniform { low, high } => format!("{:?}, {:?}", low, high),
        DistKind::DiscreteUniform { low, high } => format!("{}, {}", low, high),
        DistKind::Bernoulli { p } => format!("{:?}", p),
        DistKind::Categorical { probs } => format_list(probs, Dtype::Float),
        DistKind::List { values, dtype } => format_list(values, *dtype),
    };
    let suffix = if d.per_timestep { ", per_timestep" } else { "" };
    let _ = write!(out, "{}({}{})", d.name(), args, suffix);
}

// --- Tokenizing ---

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenKind<'s> {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Atom(&'s str),
}

#[derive(Debug, Clone, Copy)]
struct Token<'s> {
    kind: TokenKind<'s>,
    pos: usize,
}

impl<'s> Token<'s> {
    fn text(&self) -> String {
        match self.kind {
            TokenKind::LParen => "(".into(),
            TokenKind::RParen => ")".into(),
            TokenKind::LBracket => "[".into(),
            TokenKind::RBracket => "]".into(),
            TokenKind::Comma => ",".into(),
            TokenKind::Atom(a) => a.into(),
        }
    }
}

fn tokenize(src: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut atom_start: Option<usize> = None;
    for (pos, ch) in src.char_indices() {
        let punct = match ch {
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            ',' => Some(TokenKind::Comma),
            _ => None,
        };
        if punct.is_some() || ch.is_whitespace() {
            if let Some(start) = atom_start.take() {
                tokens.push(Token { kind: TokenKind::Atom(&src[start..pos]), pos: start });
            }
            if let Some(kind) = punct {
                tokens.push(Token { kind, pos });
            }
        } else if atom_start.is_none() {
            atom_start = Some(pos);
        }
    }
    if let Some(start) = atom_start {
        tokens.push(Token { kind: TokenKind::Atom(&src[start..]), pos: start });
    }
    tokens
}

// --- Parsing ---

/// Parses canonical text into a tree, resolving names through `names`.
pub fn parse(src: &str, names: &impl NameLookup) -> Result<Expr, ParseError> {
    let tokens = tokenize(src);
    let mut parser = Parser { tokens, cursor: 0, end: src.len(), names };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(ParseError::UnexpectedToken { token: tok.text(), position: tok.pos }),
    }
}

struct Parser<'s, 'n, N: NameLookup> {
    tokens: Vec<Token<'s>>,
    cursor: usize,
    end: usize,
    names: &'n N,
}

enum Literal {
    Number(f64, Dtype),
    List(Vec<f64>, Dtype),
}

impl<'s, 'n, N: NameLookup> Parser<'s, 'n, N> {
    fn peek(&self) -> Option<Token<'s>> {
        self.tokens.get(self.cursor).copied()
    }

    fn next(&mut self) -> Result<Token<'s>, ParseError> {
        let tok = self.peek().ok_or(ParseError::UnexpectedEnd { position: self.end })?;
        self.cursor += 1;
        Ok(tok)
    }

    fn atom(&mut self) -> Result<(&'s str, usize), ParseError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Atom(a) => Ok((a, tok.pos)),
            _ => Err(ParseError::UnexpectedToken { token: tok.text(), position: tok.pos }),
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::LParen => self.call(),
            TokenKind::Atom(name) => {
                // A parenthesis glued to the atom makes it a constructor.
                match self.peek() {
                    Some(next) if next.kind == TokenKind::LParen && next.pos == tok.pos + name.len() => {
                        self.cursor += 1;
                        self.constructor(name, tok.pos)
                    }
                    _ => self.bare_atom(name, tok.pos),
                }
            }
            _ => Err(ParseError::UnexpectedToken { token: tok.text(), position: tok.pos }),
        }
    }

    /// `(head child...)` after the opening parenthesis.
    fn call(&mut self) -> Result<Expr, ParseError> {
        let (head, pos) = self.atom()?;
        let mut children = Vec::new();
        loop {
            match self.peek() {
                Some(tok) if tok.kind == TokenKind::RParen => {
                    self.cursor += 1;
                    break;
                }
                Some(_) => children.push(self.expr()?),
                None => return Err(ParseError::UnexpectedEnd { position: self.end }),
            }
        }

        if head == "timeseries" {
            return match children.as_slice() {
                [Expr::Reference(id)] => Ok(Expr::Timeseries(*id)),
                _ => Err(ParseError::UnexpectedToken { token: head.into(), position: pos }),
            };
        }
        if let Some(kind) = CompositeKind::from_symbol(head) {
            return match <[Expr; 2]>::try_from(children) {
                Ok([input, time]) => Ok(Expr::Composite(Composite::new(kind, input, time))),
                Err(children) => Err(ParseError::Graph {
                    position: pos,
                    source: GraphError::Arity { op: head.into(), expected: "2".into(), actual: children.len() },
                }),
            };
        }
        let op = Operation::from_symbol(head)
            .ok_or_else(|| ParseError::UnknownOperator { token: head.into(), position: pos })?;
        Expr::apply(op, children).map_err(|source| ParseError::Graph { position: pos, source })
    }

    fn bare_atom(&mut self, atom: &str, pos: usize) -> Result<Expr, ParseError> {
        if looks_numeric(atom) {
            let (value, dtype) = parse_number(atom, pos)?;
            return Ok(Expr::Constant(Constant::Scalar { value, dtype }));
        }
        self.names
            .id_of_name(atom)
            .map(Expr::Reference)
            .ok_or_else(|| ParseError::UnknownReference { token: atom.into(), position: pos })
    }

    /// Constructor body after `Name(`.
    fn constructor(&mut self, name: &str, pos: usize) -> Result<Expr, ParseError> {
        let mut args = Vec::new();
        let mut per_timestep = false;
        loop {
            let Some(tok) = self.peek() else {
                return Err(ParseError::UnexpectedEnd { position: self.end });
            };
            match tok.kind {
                TokenKind::RParen => {
                    self.cursor += 1;
                    break;
                }
                TokenKind::Comma if !args.is_empty() => {
                    self.cursor += 1;
                }
                TokenKind::Atom("per_timestep") => {
                    self.cursor += 1;
                    per_timestep = true;
                }
                _ => args.push(self.literal()?),
            }
        }

        let bad_args = || ParseError::UnexpectedToken { token: name.into(), position: pos };
        let number = |lit: &Literal| match lit {
            Literal::Number(v, _) => Some(*v),
            Literal::List(..) => None,
        };

        let dist = match (name, args.as_slice()) {
            ("Scalar", [Literal::Number(value, dtype)]) if !per_timestep => {
                return Ok(Expr::Constant(Constant::Scalar { value: *value, dtype: *dtype }));
            }
            ("Scalar", [Literal::List(values, dtype)]) if !per_timestep => {
                return Ok(Expr::Constant(Constant::Vector { values: values.clone(), dtype: *dtype }));
            }
            ("Normal", [a, b]) => DistKind::Normal {
                mean: number(a).ok_or_else(bad_args)?,
                std: number(b).ok_or_else(bad_args)?,
            },
            ("Uniform", [a, b]) => DistKind::Uniform {
                low: number(a).ok_or_else(bad_args)?,
                high: number(b).ok_or_else(bad_args)?,
            },
            ("DiscreteUniform", [a, b]) => DistKind::DiscreteUniform {
                low: number(a).ok_or_else(bad_args)? as i64,
                high: number(b).ok_or_else(bad_args)? as i64,
            },
            ("Bernoulli", [p]) => DistKind::Bernoulli { p: number(p).ok_or_else(bad_args)? },
            ("Categorical", [Literal::List(probs, _)]) => DistKind::Categorical { probs: probs.clone() },
            ("List", [Literal::List(values, dtype)]) => DistKind::List { values: values.clone(), dtype: *dtype },
            ("Scalar" | "Normal" | "Uniform" | "DiscreteUniform" | "Bernoulli" | "Categorical" | "List", _) => {
                return Err(bad_args());
            }
            _ => return Err(ParseError::UnknownOperator { token: name.into(), position: pos }),
        };
        Ok(Expr::Distribution(Distribution { kind: dist, per_timestep }))
    }

    fn literal(&mut self) -> Result<Literal, ParseError> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Atom(a) => {
                let (v, dtype) = parse_number(a, tok.pos)?;
                Ok(Literal::Number(v, dtype))
            }
            TokenKind::LBracket => {
                let mut values = Vec::new();
                let mut dtypes = Vec::new();
                loop {
                    let tok = self.next()?;
                    match tok.kind {
                        TokenKind::RBracket => break,
                        TokenKind::Comma if !values.is_empty() => continue,
                        TokenKind::Atom(a) => {
                            let (v, dtype) = parse_number(a, tok.pos)?;
                            values.push(v);
                            dtypes.push(dtype);
                        }
                        _ => return Err(ParseError::UnexpectedToken { token: tok.text(), position: tok.pos }),
                    }
                }
                let dtype = if dtypes.iter().all(|d| *d == Dtype::Bool) && !dtypes.is_empty() {
                    Dtype::Bool
                } else {
                    Dtype::promote_all(dtypes)
                };
                Ok(Literal::List(values, dtype))
            }
            _ => Err(ParseError::UnexpectedToken { token: tok.text(), position: tok.pos }),
        }
    }
}

fn looks_numeric(atom: &str) -> bool {
    matches!(atom, "true" | "false")
        || atom.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.')
}

fn parse_number(atom: &str, pos: usize) -> Result<(f64, Dtype), ParseError> {
    match atom {
        "true" => return Ok((1.0, Dtype::Bool)),
        "false" => return Ok((0.0, Dtype::Bool)),
        _ => {}
    }
    let invalid = || ParseError::InvalidNumber { token: atom.into(), position: pos };
    if let Ok(i) = atom.parse::<i64>() {
        return Ok((i as f64, Dtype::Int));
    }
    atom.parse::<f64>().map(|v| (v, Dtype::Float)).map_err(|_| invalid())
}
