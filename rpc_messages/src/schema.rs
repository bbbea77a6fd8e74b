/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Function identifiers and declared signatures.
//!
//! Schemas use the familiar script signature syntax:
//!
//! ```
//! # use rpc_messages::FunctionSchema;
//! # use rpc_messages::ValueType;
//! let schema: FunctionSchema = "my_module.add(int a, int b) -> int".parse().unwrap();
//! assert_eq!(schema.returns().len(), 1);
//! assert_eq!(schema.returns()[0].ty, ValueType::Int);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::parse::Parser;
use crate::parse::ParserError;
use crate::value::TYPE_DELIMS;
use crate::value::ValueType;
use crate::value::parse_type;

/// A dotted, fully qualified function name, e.g. `my_module.add`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName(String);

impl QualifiedName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The full dotted name.
    pub fn qualified_name(&self) -> &str {
        &self.0
    }

    /// The last atom of the name.
    pub fn name(&self) -> &str {
        match self.0.rsplit_once('.') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }

    /// Everything before the last atom; empty for unqualified names.
    pub fn prefix(&self) -> &str {
        match self.0.rsplit_once('.') {
            Some((prefix, _)) => prefix,
            None => "",
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QualifiedName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for QualifiedName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A named, typed argument or return slot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Argument {
    pub name: String,
    pub ty: ValueType,
}

impl Argument {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.ty)
        } else {
            write!(f, "{} {}", self.ty, self.name)
        }
    }
}

/// The declared signature of a script function.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FunctionSchema {
    name: QualifiedName,
    arguments: Vec<Argument>,
    returns: Vec<Argument>,
}

impl FunctionSchema {
    pub fn new(
        name: impl Into<QualifiedName>,
        arguments: Vec<Argument>,
        returns: Vec<Argument>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments,
            returns,
        }
    }

    pub fn name(&self) -> &QualifiedName {
        &self.name
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn returns(&self) -> &[Argument] {
        &self.returns
    }
}

impl fmt::Display for FunctionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments: Vec<String> = self.arguments.iter().map(ToString::to_string).collect();
        write!(f, "{}({}) -> ", self.name, arguments.join(", "))?;
        match self.returns.as_slice() {
            [single] => write!(f, "{}", single),
            returns => {
                let returns: Vec<String> = returns.iter().map(ToString::to_string).collect();
                write!(f, "({})", returns.join(", "))
            }
        }
    }
}

impl FromStr for FunctionSchema {
    type Err = ParserError;

    /// Parse `name(type arg, ...) -> ret`, where `ret` is a single type or a
    /// parenthesized (possibly empty) list of types.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s, TYPE_DELIMS);
        let name = parser.next_or_err("a function name")?;
        parser.expect("(")?;

        let mut arguments = Vec::new();
        if parser.peek() != Some(")") {
            loop {
                let ty = parse_type(&mut parser)?;
                let name = parser.next_or_err("an argument name")?;
                if TYPE_DELIMS.contains(&name) {
                    return Err(ParserError::WrongTokenType {
                        expected_type: "argument name",
                        actual: name.to_string(),
                    });
                }
                arguments.push(Argument::new(name, ty));
                if parser.peek() == Some(",") {
                    parser.expect(",")?;
                } else {
                    break;
                }
            }
        }
        parser.expect(")")?;
        parser.expect("->")?;

        let mut returns = Vec::new();
        if parser.peek_or_err("a return type")? == "(" {
            parser.expect("(")?;
            if parser.peek() != Some(")") {
                loop {
                    returns.push(Argument::new("", parse_type(&mut parser)?));
                    if parser.peek() == Some(",") {
                        parser.expect(",")?;
                    } else {
                        break;
                    }
                }
            }
            parser.expect(")")?;
        } else {
            returns.push(Argument::new("", parse_type(&mut parser)?));
        }
        parser.expect_end()?;

        Ok(Self::new(name, arguments, returns))
    }
}
