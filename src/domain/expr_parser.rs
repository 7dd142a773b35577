//! Condition parser.
//!
//! Recursive descent over the token stream, lowest precedence first:
//!
//! ```text
//! expr        := or
//! or          := and ( "or" and )*
//! and         := comparison ( "and" comparison )*
//! comparison  := primary ( op primary )*
//! primary     := "(" expr ")" | IDENT "." IDENT "." IDENT | IDENT "(" args ")"
//!              | NUMBER | STRING | "[" STRING ("," STRING)* "]"
//! ```
//!
//! Chained comparisons fold left to right, so `a > b == c` is `(a > b) == c`.

use crate::domain::error::ParseError;
use crate::domain::expr::{BinaryOp, FieldRef, Literal, Node};
use crate::domain::token::{Keyword, Token, TokenKind, Tokenizer};

struct Parser<'a> {
    tokens: Tokenizer<'a>,
    current: Token,
}

fn comparison_op(kind: TokenKind) -> Option<BinaryOp> {
    match kind {
        TokenKind::Gt => Some(BinaryOp::Gt),
        TokenKind::Lt => Some(BinaryOp::Lt),
        TokenKind::Ge => Some(BinaryOp::Ge),
        TokenKind::Le => Some(BinaryOp::Le),
        TokenKind::Eq => Some(BinaryOp::Eq),
        TokenKind::Ne => Some(BinaryOp::Ne),
        TokenKind::Keyword(Keyword::In) => Some(BinaryOp::In),
        TokenKind::Keyword(Keyword::NotIn) => Some(BinaryOp::NotIn),
        TokenKind::Keyword(Keyword::Has) | TokenKind::Keyword(Keyword::Contains) => {
            Some(BinaryOp::Has)
        }
        _ => None,
    }
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        let mut tokens = Tokenizer::new(input);
        let current = tokens.next_token();
        Self { tokens, current }
    }

    fn bump(&mut self) -> Token {
        let next = self.tokens.next_token();
        std::mem::replace(&mut self.current, next)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let message = match self.current.kind {
            TokenKind::Eof => format!("unexpected end of input, expected {}", expected),
            TokenKind::Illegal => format!("unexpected character '{}'", self.current.text),
            _ => format!("expected {}, found '{}'", expected, self.current.text),
        };
        ParseError::new(message, self.current.offset)
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<Token, ParseError> {
        if self.check(kind) {
            Ok(self.bump())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn parse_or(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(TokenKind::Keyword(Keyword::Or)) {
            self.bump();
            let right = self.parse_and()?;
            left = Node::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_comparison()?;
        while self.check(TokenKind::Keyword(Keyword::And)) {
            self.bump();
            let right = self.parse_comparison()?;
            left = Node::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Node, ParseError> {
        let mut left = self.parse_primary()?;
        while let Some(op) = comparison_op(self.current.kind) {
            self.bump();
            let right = self.parse_primary()?;
            left = Node::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Node, ParseError> {
        match self.current.kind {
            TokenKind::LParen => {
                let open = self.bump();
                let inner = self.parse_or()?;
                if self.check(TokenKind::RParen) {
                    self.bump();
                    Ok(inner)
                } else if self.check(TokenKind::Eof) {
                    Err(ParseError::new(
                        format!("unmatched '(' opened at position {}", open.offset),
                        self.current.offset,
                    ))
                } else {
                    Err(self.unexpected("')'"))
                }
            }
            TokenKind::Ident => {
                let name = self.bump();
                match self.current.kind {
                    TokenKind::LParen => self.parse_call(name),
                    TokenKind::Dot => self.parse_field(name),
                    _ => Err(ParseError::new(
                        format!(
                            "bare identifier '{}': expected module.entity.field or a function call",
                            name.text
                        ),
                        name.offset,
                    )),
                }
            }
            TokenKind::Keyword(Keyword::Has) | TokenKind::Keyword(Keyword::Contains) => {
                let name = self.bump();
                if self.check(TokenKind::LParen) {
                    self.parse_call(name)
                } else {
                    Err(ParseError::new(
                        format!("'{}' needs a left operand", name.text),
                        name.offset,
                    ))
                }
            }
            TokenKind::Number => {
                let token = self.bump();
                token
                    .text
                    .parse::<f64>()
                    .map(Node::number)
                    .map_err(|_| ParseError::new(format!("invalid number: {}", token.text), token.offset))
            }
            TokenKind::Str => Ok(Node::text(self.bump().text)),
            TokenKind::LBracket => self.parse_list(),
            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_call(&mut self, name: Token) -> Result<Node, ParseError> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if self.check(TokenKind::RParen) {
            self.bump();
            return Ok(Node::call(name.text, args));
        }
        loop {
            args.push(self.parse_or()?);
            if self.check(TokenKind::Comma) {
                self.bump();
                continue;
            }
            if self.check(TokenKind::Eof) {
                return Err(ParseError::new(
                    format!("unmatched '(' in call to '{}'", name.text),
                    self.current.offset,
                ));
            }
            self.expect(TokenKind::RParen, "',' or ')'")?;
            break;
        }
        Ok(Node::call(name.text, args))
    }

    fn parse_field(&mut self, module: Token) -> Result<Node, ParseError> {
        let malformed = |offset: usize| {
            ParseError::new(
                format!(
                    "malformed field reference starting at '{}': expected module.entity.field",
                    module.text
                ),
                offset,
            )
        };

        self.expect(TokenKind::Dot, "'.'")?;
        let entity = self.expect(TokenKind::Ident, "entity name")?;
        if !self.check(TokenKind::Dot) {
            return Err(malformed(self.current.offset));
        }
        self.bump();
        let field = self.expect(TokenKind::Ident, "field name")?;
        if self.check(TokenKind::Dot) {
            return Err(malformed(self.current.offset));
        }

        Ok(Node::Field(FieldRef::new(module.text, entity.text, field.text)))
    }

    fn parse_list(&mut self) -> Result<Node, ParseError> {
        self.expect(TokenKind::LBracket, "'['")?;
        let mut items = Vec::new();
        loop {
            if !self.check(TokenKind::Str) {
                return Err(self.unexpected("string array element"));
            }
            items.push(self.bump().text);
            if self.check(TokenKind::Comma) {
                self.bump();
                continue;
            }
            self.expect(TokenKind::RBracket, "',' or ']'")?;
            break;
        }
        Ok(Node::Literal(Literal::List(items)))
    }

    fn parse(mut self) -> Result<Node, ParseError> {
        if self.check(TokenKind::Eof) {
            return Err(ParseError::new("empty expression", self.current.offset));
        }
        let node = self.parse_or()?;
        if !self.check(TokenKind::Eof) {
            return Err(ParseError::new(
                format!("unexpected '{}' after expression", self.current.text),
                self.current.offset,
            ));
        }
        Ok(node)
    }
}

pub fn parse(input: &str) -> Result<Node, ParseError> {
    Parser::new(input).parse()
}

/// Syntax-only check. Registry-aware checks live in [`crate::domain::registry::Registry::validate`].
pub fn validate(input: &str) -> Result<(), ParseError> {
    parse(input).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(module: &str, entity: &str, name: &str) -> Node {
        Node::Field(FieldRef::new(module, entity, name))
    }

    #[test]
    fn parse_simple_comparison() {
        let node = parse("market.BTC.last_px > 200").unwrap();
        assert_eq!(
            node,
            Node::binary(
                BinaryOp::Gt,
                field("market", "BTC", "last_px"),
                Node::number(200.0)
            )
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let node = parse("1 > 0 or 2 > 1 and 3 > 2").unwrap();
        match node {
            Node::Binary {
                op: BinaryOp::Or,
                right,
                ..
            } => assert!(matches!(
                *right,
                Node::Binary {
                    op: BinaryOp::And,
                    ..
                }
            )),
            other => panic!("expected or at the root, got {other:?}"),
        }
    }

    #[test]
    fn comparisons_fold_left() {
        let node = parse("1 < 2 == 3").unwrap();
        assert_eq!(
            node,
            Node::binary(
                BinaryOp::Eq,
                Node::binary(BinaryOp::Lt, Node::number(1.0), Node::number(2.0)),
                Node::number(3.0)
            )
        );
    }

    #[test]
    fn parentheses_override_precedence() {
        let node = parse("(1 > 0 or 2 > 1) and 3 > 2").unwrap();
        assert!(matches!(
            node,
            Node::Binary {
                op: BinaryOp::And,
                ..
            }
        ));
    }

    #[test]
    fn parse_function_call() {
        let node = parse("avg(candles.BTC.close, 5) > candles.BTC.last_px").unwrap();
        assert_eq!(
            node,
            Node::binary(
                BinaryOp::Gt,
                Node::call(
                    "avg",
                    vec![field("candles", "BTC", "close"), Node::number(5.0)]
                ),
                field("candles", "BTC", "last_px")
            )
        );
    }

    #[test]
    fn parse_zero_arg_call() {
        assert_eq!(parse("now()").unwrap(), Node::call("now", vec![]));
    }

    #[test]
    fn has_keyword_as_function_and_operator() {
        let call = parse(r#"has(news.coindesk.title, "ETF")"#).unwrap();
        assert!(matches!(call, Node::Call { ref name, .. } if name == "has"));

        let op = parse(r#"news.coindesk.title contains "ETF""#).unwrap();
        assert!(matches!(
            op,
            Node::Binary {
                op: BinaryOp::Has,
                ..
            }
        ));
    }

    #[test]
    fn parse_membership() {
        let node = parse(r#""x" in ["x", "y"]"#).unwrap();
        assert_eq!(
            node,
            Node::binary(
                BinaryOp::In,
                Node::text("x"),
                Node::Literal(Literal::List(vec!["x".into(), "y".into()]))
            )
        );
        assert!(parse(r#""z" not_in ["x"]"#).is_ok());
    }

    #[test]
    fn error_dangling_operator() {
        let err = parse("a.b.c >").unwrap_err();
        assert!(err.message.contains("unexpected end of input"));
        assert_eq!(err.position, 7);
    }

    #[test]
    fn error_unmatched_paren() {
        let err = parse("(a.b.c > 1").unwrap_err();
        assert!(err.message.contains("unmatched '('"));
    }

    #[test]
    fn error_empty_input() {
        let err = parse("").unwrap_err();
        assert_eq!(err.message, "empty expression");
        assert_eq!(err.position, 0);
        assert!(parse("   ").is_err());
    }

    #[test]
    fn error_trailing_tokens() {
        let err = parse("a.b.c > 1 2").unwrap_err();
        assert!(err.message.contains("after expression"));
        assert_eq!(err.position, 10);
        assert!(parse("a.b.c > 1)").is_err());
    }

    #[test]
    fn error_bare_identifier() {
        let err = parse("price > 1").unwrap_err();
        assert!(err.message.contains("bare identifier 'price'"));
    }

    #[test]
    fn error_wrong_dot_count() {
        assert!(parse("market.BTC > 1")
            .unwrap_err()
            .message
            .contains("malformed field reference"));
        assert!(parse("market.BTC.last.px > 1")
            .unwrap_err()
            .message
            .contains("malformed field reference"));
    }

    #[test]
    fn error_non_string_array_element() {
        let err = parse(r#""x" in ["a", 1]"#).unwrap_err();
        assert!(err.message.contains("string array element"));
        assert!(parse(r#""x" in []"#).is_err());
    }

    #[test]
    fn error_illegal_character() {
        let err = parse("a.b.c > @").unwrap_err();
        assert!(err.message.contains("unexpected character '@'"));
        assert_eq!(err.position, 8);
    }

    #[test]
    fn error_unclosed_call() {
        let err = parse("avg(a.b.c, 5").unwrap_err();
        assert!(err.message.contains("unmatched '('"));
    }

    #[test]
    fn validate_discards_node() {
        assert!(validate("1 > 0").is_ok());
        assert!(validate("1 >").is_err());
    }

    #[test]
    fn rendering_reparses_to_same_tree() {
        let input = r#"(avg(candles.BTC.close,5) > candles.BTC.last_px) and (time_since(news.coindesk.last_update_time) < 600) or "a\n" in ["a\n"]"#;
        let node = parse(input).unwrap();
        assert_eq!(parse(&node.to_string()).unwrap(), node);
    }
}
