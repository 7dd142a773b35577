//! Condition tokenizer.
//!
//! Turns a condition string into a pull-based stream of [`Token`]s. The
//! tokenizer never fails: bytes it does not recognise come out as
//! [`TokenKind::Illegal`] and the parser reports them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    And,
    Or,
    In,
    NotIn,
    Has,
    Contains,
}

impl Keyword {
    fn lookup(word: &str) -> Option<Self> {
        match word {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "in" => Some(Self::In),
            "not_in" => Some(Self::NotIn),
            "has" => Some(Self::Has),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Keyword(Keyword),
    Number,
    Str,
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Illegal,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Ident => "identifier",
            TokenKind::Keyword(_) => "keyword",
            TokenKind::Number => "number",
            TokenKind::Str => "string",
            TokenKind::Gt => "'>'",
            TokenKind::Lt => "'<'",
            TokenKind::Ge => "'>='",
            TokenKind::Le => "'<='",
            TokenKind::Eq => "'=='",
            TokenKind::Ne => "'!='",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBracket => "'['",
            TokenKind::RBracket => "']'",
            TokenKind::Comma => "','",
            TokenKind::Dot => "'.'",
            TokenKind::Illegal => "illegal character",
            TokenKind::Eof => "end of input",
        };
        f.write_str(s)
    }
}

/// A lexical token. `text` holds the decoded value for strings and the raw
/// source slice for everything else; `offset` is the byte offset of the
/// token's first character.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub offset: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            offset,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }
}

pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.remaining().chars().nth(1)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    /// Produce the next token. Returns `Eof` forever once input is exhausted.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();
        let start = self.pos;
        let Some(ch) = self.peek() else {
            return Token::new(TokenKind::Eof, "", start);
        };

        if ch.is_ascii_alphabetic() {
            return self.read_word(start);
        }
        if ch.is_ascii_digit() {
            return self.read_number(start);
        }
        if ch == '"' {
            return self.read_string(start);
        }

        let two = match (ch, self.peek_second()) {
            ('>', Some('=')) => Some(TokenKind::Ge),
            ('<', Some('=')) => Some(TokenKind::Le),
            ('=', Some('=')) => Some(TokenKind::Eq),
            ('!', Some('=')) => Some(TokenKind::Ne),
            _ => None,
        };
        if let Some(kind) = two {
            self.pos += 2;
            return Token::new(kind, &self.input[start..self.pos], start);
        }

        self.advance();
        let kind = match ch {
            '>' => TokenKind::Gt,
            '<' => TokenKind::Lt,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            _ => TokenKind::Illegal,
        };
        Token::new(kind, &self.input[start..self.pos], start)
    }

    fn read_word(&mut self, start: usize) -> Token {
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.advance();
        }
        let word = &self.input[start..self.pos];
        let kind = Keyword::lookup(word).map_or(TokenKind::Ident, TokenKind::Keyword);
        Token::new(kind, word, start)
    }

    fn read_number(&mut self, start: usize) -> Token {
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.'
                && !seen_dot
                && self.peek_second().is_some_and(|n| n.is_ascii_digit())
            {
                seen_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        Token::new(TokenKind::Number, &self.input[start..self.pos], start)
    }

    fn read_string(&mut self, start: usize) -> Token {
        self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                None => {
                    // Unterminated: hand the raw remainder to the parser as illegal.
                    return Token::new(TokenKind::Illegal, &self.input[start..], start);
                }
                Some('"') => return Token::new(TokenKind::Str, value, start),
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => {
                        return Token::new(TokenKind::Illegal, &self.input[start..], start);
                    }
                },
                Some(c) => value.push(c),
            }
        }
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let token = self.next_token();
        (!token.is_eof()).then_some(token)
    }
}

/// Tokenize a whole string, excluding the trailing `Eof`.
pub fn tokenize(input: &str) -> Vec<Token> {
    Tokenizer::new(input).collect()
}
