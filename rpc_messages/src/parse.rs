/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tokenizing for type expressions and function schemas.

/// Errors produced while parsing a type or a schema.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("unexpected end of input, wanted {expected}")]
    UnexpectedEndOfInput { expected: &'static str },

    #[error("wanted '{expected}', found '{actual}'")]
    WrongToken {
        expected: &'static str,
        actual: String,
    },

    #[error("'{actual}' cannot be used as {expected_type}")]
    WrongTokenType {
        expected_type: &'static str,
        actual: String,
    },

    #[error("unconsumed input after the last token: '{0}'")]
    TrailingInput(String),
}

/// Split `input` into tokens. Whitespace separates tokens; each delimiter
/// is a token of its own, even when not surrounded by whitespace.
fn tokenize<'a>(input: &'a str, delims: &[&str]) -> Vec<&'a str> {
    let mut tokens = Vec::new();
    for word in input.split_whitespace() {
        let mut start = 0;
        let mut pos = 0;
        while pos < word.len() {
            match delims.iter().find(|delim| word[pos..].starts_with(**delim)) {
                Some(delim) => {
                    if start < pos {
                        tokens.push(&word[start..pos]);
                    }
                    tokens.push(&word[pos..pos + delim.len()]);
                    pos += delim.len();
                    start = pos;
                }
                None => {
                    pos += word[pos..].chars().next().map_or(1, char::len_utf8);
                }
            }
        }
        if start < word.len() {
            tokens.push(&word[start..]);
        }
    }
    tokens
}

/// A cursor over the tokens of a string.
#[derive(Debug, Clone)]
pub struct Parser<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str, delims: &[&str]) -> Self {
        Self {
            tokens: tokenize(input, delims),
            pos: 0,
        }
    }

    /// The next token, without consuming it.
    pub fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    pub fn peek_or_err(&self, expected: &'static str) -> Result<&'a str, ParserError> {
        self.peek()
            .ok_or(ParserError::UnexpectedEndOfInput { expected })
    }

    /// Consume the next token, which must be `expected`.
    pub fn expect(&mut self, expected: &'static str) -> Result<(), ParserError> {
        match self.peek_or_err(expected)? {
            token if token == expected => {
                self.pos += 1;
                Ok(())
            }
            token => Err(ParserError::WrongToken {
                expected,
                actual: token.to_string(),
            }),
        }
    }

    pub fn next_or_err(&mut self, expected: &'static str) -> Result<&'a str, ParserError> {
        self.next()
            .ok_or(ParserError::UnexpectedEndOfInput { expected })
    }

    /// Fails if any token is left.
    pub fn expect_end(&self) -> Result<(), ParserError> {
        if self.is_empty() {
            return Ok(());
        }
        Err(ParserError::TrailingInput(self.tokens[self.pos..].join(" ")))
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

impl<'a> Iterator for Parser<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.peek()?;
        self.pos += 1;
        Some(token)
    }
}
