//! Recursive-descent parser for the expression language.
//!
//! The grammar is a conventional operator-precedence ladder with JSONPath
//! selectors as primaries. Selectors hang off `$` (document root) or `@`
//! (current node in a filter); bare identifiers are only meaningful as
//! function calls.

use crate::expr::ast::{BinaryOp, Expr, PathRoot, Segment, UnaryOp, UnionMember};
use crate::expr::lexer::{tokenize, LexError, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("unexpected token at {pos}: expected {expected}, got {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        pos: usize,
    },
    #[error("expected integer index at {pos}")]
    ExpectedInteger { pos: usize },
    #[error("bare identifier '{name}' at {pos}; selectors must start with '$' or '@'")]
    BareIdentifier { name: String, pos: usize },
    #[error("placeholder body at {pos} must be a '$' or '@' selector")]
    PlaceholderBody { pos: usize },
}

pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, index: 0 };
    let expr = parser.parse_ternary()?;
    parser.expect_kind(&TokenKind::Eof, "end of expression")?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_coalesce()?;
        if !self.match_kind(&TokenKind::Question) {
            return Ok(cond);
        }
        let then_expr = self.parse_ternary()?;
        let else_expr = if self.match_kind(&TokenKind::Colon) {
            self.parse_ternary()?
        } else {
            Expr::Null
        };
        Ok(Expr::Ternary {
            cond: Box::new(cond),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn parse_coalesce(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_or()?;
        while self.match_kind(&TokenKind::QuestionQuestion) {
            let right = self.parse_or()?;
            node = binary(BinaryOp::Coalesce, node, right);
        }
        Ok(node)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_and()?;
        while self.match_kind(&TokenKind::OrOr) {
            let right = self.parse_and()?;
            node = binary(BinaryOp::Or, node, right);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_equality()?;
        while self.match_kind(&TokenKind::AndAnd) {
            let right = self.parse_equality()?;
            node = binary(BinaryOp::And, node, right);
        }
        Ok(node)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_comparison()?;
        loop {
            let op = if self.match_kind(&TokenKind::EqEq) {
                BinaryOp::Eq
            } else if self.match_kind(&TokenKind::BangEq) {
                BinaryOp::Ne
            } else if self.match_kind(&TokenKind::EqTilde) {
                BinaryOp::Matches
            } else if self.match_kind(&TokenKind::BangTilde) {
                BinaryOp::NotMatches
            } else {
                break;
            };
            let right = self.parse_comparison()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_bit_or()?;
        loop {
            let op = if self.match_kind(&TokenKind::Lt) {
                BinaryOp::Lt
            } else if self.match_kind(&TokenKind::Le) {
                BinaryOp::Le
            } else if self.match_kind(&TokenKind::Gt) {
                BinaryOp::Gt
            } else if self.match_kind(&TokenKind::Ge) {
                BinaryOp::Ge
            } else if self.match_kind(&TokenKind::In) {
                BinaryOp::In
            } else {
                break;
            };
            let right = self.parse_bit_or()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_bit_or(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_bit_xor()?;
        while self.match_kind(&TokenKind::Pipe) {
            let right = self.parse_bit_xor()?;
            node = binary(BinaryOp::BitOr, node, right);
        }
        Ok(node)
    }

    fn parse_bit_xor(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_bit_and()?;
        while self.match_kind(&TokenKind::Caret) {
            let right = self.parse_bit_and()?;
            node = binary(BinaryOp::BitXor, node, right);
        }
        Ok(node)
    }

    fn parse_bit_and(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_shift()?;
        while self.match_kind(&TokenKind::Amp) {
            let right = self.parse_shift()?;
            node = binary(BinaryOp::BitAnd, node, right);
        }
        Ok(node)
    }

    fn parse_shift(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_term()?;
        loop {
            let op = if self.match_kind(&TokenKind::Shl) {
                BinaryOp::Shl
            } else if self.match_kind(&TokenKind::Shr) {
                BinaryOp::Shr
            } else {
                break;
            };
            let right = self.parse_term()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_factor()?;
        loop {
            let op = if self.match_kind(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.match_kind(&TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_factor()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut node = self.parse_unary()?;
        loop {
            let op = if self.match_kind(&TokenKind::Star) {
                BinaryOp::Mul
            } else if self.match_kind(&TokenKind::Slash) {
                BinaryOp::Div
            } else if self.match_kind(&TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            node = binary(op, node, right);
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.match_kind(&TokenKind::Bang) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        if self.match_kind(&TokenKind::Minus) {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::True => Ok(Expr::Bool(true)),
            TokenKind::False => Ok(Expr::Bool(false)),
            TokenKind::Null => Ok(Expr::Null),
            TokenKind::Dollar => {
                let segments = self.parse_segments()?;
                Ok(Expr::Path {
                    root: PathRoot::Root,
                    segments,
                })
            }
            TokenKind::At => {
                let segments = self.parse_segments()?;
                Ok(Expr::Path {
                    root: PathRoot::Current,
                    segments,
                })
            }
            TokenKind::Ident(name) => {
                if self.match_kind(&TokenKind::LParen) {
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_ternary()?);
                            if !self.match_kind(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect_kind(&TokenKind::RParen, ")")?;
                    Ok(Expr::Call { name, args })
                } else {
                    Err(ParseError::BareIdentifier {
                        name,
                        pos: token.pos,
                    })
                }
            }
            TokenKind::LParen => {
                let expr = self.parse_ternary()?;
                self.expect_kind(&TokenKind::RParen, ")")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_ternary()?);
                        if !self.match_kind(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect_kind(&TokenKind::RBracket, "]")?;
                Ok(Expr::Array(items))
            }
            TokenKind::LBrace => self.parse_brace(token.pos),
            other => Err(ParseError::UnexpectedToken {
                expected: "expression".into(),
                found: format!("{:?}", other),
                pos: token.pos,
            }),
        }
    }

    /// `{…}` is either a placeholder form `{#i: $…}` or a JSON object
    /// literal `{"k": v, …}`, decided by the first key token.
    fn parse_brace(&mut self, open_pos: usize) -> Result<Expr, ParseError> {
        if let TokenKind::Placeholder(ordinal) = self.peek().kind.clone() {
            self.advance();
            self.expect_kind(&TokenKind::Colon, ":")?;
            let body_pos = self.peek().pos;
            let body = self.parse_ternary()?;
            self.expect_kind(&TokenKind::RBrace, "}")?;
            return match body {
                Expr::Path { root, segments } => Ok(Expr::Placeholder {
                    ordinal,
                    root,
                    segments,
                }),
                _ => Err(ParseError::PlaceholderBody { pos: body_pos }),
            };
        }

        let mut entries = Vec::new();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let key_token = self.advance();
                let key = match key_token.kind {
                    TokenKind::Str(s) => s,
                    other => {
                        return Err(ParseError::UnexpectedToken {
                            expected: "object key".into(),
                            found: format!("{:?}", other),
                            pos: key_token.pos,
                        })
                    }
                };
                self.expect_kind(&TokenKind::Colon, ":")?;
                let value = self.parse_ternary()?;
                entries.push((key, value));
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect_kind(&TokenKind::RBrace, "}")
            .map_err(|_| ParseError::UnexpectedToken {
                expected: "}".into(),
                found: "end of object".into(),
                pos: open_pos,
            })?;
        Ok(Expr::Object(entries))
    }

    fn parse_segments(&mut self) -> Result<Vec<Segment>, ParseError> {
        let mut segments = Vec::new();
        loop {
            if self.match_kind(&TokenKind::Dot) {
                segments.push(self.parse_dot_step()?);
            } else if self.match_kind(&TokenKind::DotDot) {
                let inner = if self.match_kind(&TokenKind::LBracket) {
                    self.parse_bracket_step()?
                } else {
                    self.parse_dot_step()?
                };
                segments.push(Segment::Descent(Box::new(inner)));
            } else if self.match_kind(&TokenKind::LBracket) {
                segments.push(self.parse_bracket_step()?);
            } else {
                break;
            }
        }
        Ok(segments)
    }

    fn parse_dot_step(&mut self) -> Result<Segment, ParseError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Ident(name) => Ok(Segment::Key(name)),
            TokenKind::Star => Ok(Segment::Wildcard),
            // Keywords double as plain keys after a dot: `$.spec.in` etc.
            TokenKind::In => Ok(Segment::Key("in".into())),
            TokenKind::True => Ok(Segment::Key("true".into())),
            TokenKind::False => Ok(Segment::Key("false".into())),
            TokenKind::Null => Ok(Segment::Key("null".into())),
            other => Err(ParseError::UnexpectedToken {
                expected: "key or *".into(),
                found: format!("{:?}", other),
                pos: token.pos,
            }),
        }
    }

    /// Parses the inside of `[…]`, consuming the closing bracket.
    fn parse_bracket_step(&mut self) -> Result<Segment, ParseError> {
        if self.match_kind(&TokenKind::Star) {
            self.expect_kind(&TokenKind::RBracket, "]")?;
            return Ok(Segment::Wildcard);
        }
        if self.match_kind(&TokenKind::Question) {
            let predicate = self.parse_ternary()?;
            self.expect_kind(&TokenKind::RBracket, "]")?;
            return Ok(Segment::Filter(Box::new(predicate)));
        }

        // Slice with an omitted start, e.g. `[:4]` or `[::2]`.
        if self.check(&TokenKind::Colon) {
            return self.parse_slice(None);
        }

        let first = self.parse_union_member()?;
        if self.check(&TokenKind::Colon) {
            let start = match first {
                UnionMember::Index(i) => i,
                UnionMember::Key(_) => {
                    return Err(ParseError::ExpectedInteger {
                        pos: self.peek().pos,
                    })
                }
            };
            return self.parse_slice(Some(start));
        }

        if self.check(&TokenKind::Comma) {
            let mut members = vec![first];
            while self.match_kind(&TokenKind::Comma) {
                members.push(self.parse_union_member()?);
            }
            self.expect_kind(&TokenKind::RBracket, "]")?;
            return Ok(Segment::Union(members));
        }

        self.expect_kind(&TokenKind::RBracket, "]")?;
        Ok(match first {
            UnionMember::Index(i) => Segment::Index(i),
            UnionMember::Key(k) => Segment::Key(k),
        })
    }

    fn parse_slice(&mut self, start: Option<i64>) -> Result<Segment, ParseError> {
        self.expect_kind(&TokenKind::Colon, ":")?;
        let stop = self.parse_optional_slice_bound()?;
        let step = if self.match_kind(&TokenKind::Colon) {
            self.parse_optional_slice_bound()?
        } else {
            None
        };
        self.expect_kind(&TokenKind::RBracket, "]")?;
        Ok(Segment::Slice { start, stop, step })
    }

    fn parse_optional_slice_bound(&mut self) -> Result<Option<i64>, ParseError> {
        if self.check(&TokenKind::Colon) || self.check(&TokenKind::RBracket) {
            return Ok(None);
        }
        match self.parse_union_member()? {
            UnionMember::Index(i) => Ok(Some(i)),
            UnionMember::Key(_) => Err(ParseError::ExpectedInteger {
                pos: self.peek().pos,
            }),
        }
    }

    fn parse_union_member(&mut self) -> Result<UnionMember, ParseError> {
        let negative = self.match_kind(&TokenKind::Minus);
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) if n.fract() == 0.0 => {
                let value = n as i64;
                Ok(UnionMember::Index(if negative { -value } else { value }))
            }
            TokenKind::Number(_) => Err(ParseError::ExpectedInteger { pos: token.pos }),
            TokenKind::Str(s) if !negative => Ok(UnionMember::Key(s)),
            other => Err(ParseError::UnexpectedToken {
                expected: "index or quoted key".into(),
                found: format!("{:?}", other),
                pos: token.pos,
            }),
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kind(&mut self, kind: &TokenKind, expected: &str) -> Result<Token, ParseError> {
        let token = self.advance();
        if &token.kind == kind {
            Ok(token)
        } else {
            Err(ParseError::UnexpectedToken {
                expected: expected.into(),
                found: format!("{:?}", token.kind),
                pos: token.pos,
            })
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.index.min(self.tokens.len() - 1)].clone();
        if self.index + 1 < self.tokens.len() {
            self.index += 1;
        }
        token
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
