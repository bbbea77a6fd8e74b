/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The value interchange type carried by script calls and their
//! results, and the types used to describe them in function schemas.

use std::fmt;
use std::str::FromStr;

use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

use crate::parse::Parser;
use crate::parse::ParserError;

/// A small dense tensor. Elements are stored row-major.
///
/// The data always holds exactly as many elements as the shape describes;
/// decoding goes through [`Tensor::new`] so that tensors received from a
/// peer are checked too.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

/// The unchecked wire form of a [`Tensor`].
#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = ShapeError;

    fn try_from(raw: RawTensor) -> Result<Self, Self::Error> {
        Tensor::new(raw.shape, raw.data)
    }
}

/// Returned when a shape does not describe a valid tensor.
#[derive(Debug, thiserror::Error)]
pub enum ShapeError {
    #[error("tensor of shape {shape:?} needs {expected} elements, got {actual}")]
    Mismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("tensor of shape {0:?} has too many elements")]
    TooLarge(Vec<usize>),
}

/// The element count of `shape`, if a buffer of that many elements can
/// exist.
fn checked_numel(shape: &[usize]) -> Result<usize, ShapeError> {
    shape
        .iter()
        .try_fold(1usize, |numel, dim| numel.checked_mul(*dim))
        .filter(|numel| {
            numel
                .checked_mul(std::mem::size_of::<f64>())
                .is_some_and(|bytes| bytes <= isize::MAX as usize)
        })
        .ok_or_else(|| ShapeError::TooLarge(shape.to_vec()))
}

impl Tensor {
    /// Create a tensor with the given shape and row-major data.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self, ShapeError> {
        let expected = checked_numel(&shape)?;
        if expected != data.len() {
            return Err(ShapeError::Mismatch {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// A tensor of the given shape with every element set to `value`.
    pub fn full(shape: Vec<usize>, value: f64) -> Result<Self, ShapeError> {
        let numel = checked_numel(&shape)?;
        Ok(Self {
            shape,
            data: vec![value; numel],
        })
    }

    /// A tensor of the given shape filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Result<Self, ShapeError> {
        Self::full(shape, 0.0)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// The number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

/// A value passed to, or returned from, a script function.
// Bool is listed before Int so that decoders which try variants in
// order never read a bool as an int.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, EnumAsInner)]
pub enum WireValue {
    None,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    Tensor(Tensor),
    List(Vec<WireValue>),
    Tuple(Vec<WireValue>),
    Dict(Vec<(WireValue, WireValue)>),
}

impl WireValue {
    /// The most specific type describing this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            WireValue::None => ValueType::None,
            WireValue::Bool(_) => ValueType::Bool,
            WireValue::Int(_) => ValueType::Int,
            WireValue::Double(_) => ValueType::Float,
            WireValue::String(_) => ValueType::String,
            WireValue::IntList(_) => ValueType::List(Box::new(ValueType::Int)),
            WireValue::DoubleList(_) => ValueType::List(Box::new(ValueType::Float)),
            WireValue::Tensor(_) => ValueType::Tensor,
            WireValue::List(values) => match values.first().map(WireValue::value_type) {
                Some(first) if values.iter().all(|value| value.value_type() == first) => {
                    ValueType::List(Box::new(first))
                }
                _ => ValueType::List(Box::new(ValueType::Any)),
            },
            WireValue::Tuple(values) => {
                ValueType::Tuple(values.iter().map(WireValue::value_type).collect())
            }
            WireValue::Dict(_) => {
                ValueType::Dict(Box::new(ValueType::Any), Box::new(ValueType::Any))
            }
        }
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seq(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = String>) -> fmt::Result {
            write!(f, "{}", items.collect::<Vec<_>>().join(", "))
        }
        match self {
            WireValue::None => write!(f, "None"),
            WireValue::Bool(value) => write!(f, "{}", value),
            WireValue::Int(value) => write!(f, "{}", value),
            WireValue::Double(value) => write!(f, "{}", value),
            WireValue::String(value) => write!(f, "{:?}", value),
            WireValue::IntList(values) => {
                write!(f, "[")?;
                seq(f, values.iter().map(ToString::to_string))?;
                write!(f, "]")
            }
            WireValue::DoubleList(values) => {
                write!(f, "[")?;
                seq(f, values.iter().map(ToString::to_string))?;
                write!(f, "]")
            }
            WireValue::Tensor(tensor) => write!(f, "tensor(shape={:?})", tensor.shape()),
            WireValue::List(values) => {
                write!(f, "[")?;
                seq(f, values.iter().map(ToString::to_string))?;
                write!(f, "]")
            }
            WireValue::Tuple(values) => {
                write!(f, "(")?;
                seq(f, values.iter().map(ToString::to_string))?;
                write!(f, ")")
            }
            WireValue::Dict(entries) => {
                write!(f, "{{")?;
                seq(f, entries.iter().map(|(k, v)| format!("{}: {}", k, v)))?;
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for WireValue {
    fn from(value: bool) -> Self {
        WireValue::Bool(value)
    }
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        WireValue::Int(value)
    }
}

impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        WireValue::Double(value)
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::String(value)
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::String(value.to_string())
    }
}

impl From<Vec<i64>> for WireValue {
    fn from(values: Vec<i64>) -> Self {
        WireValue::IntList(values)
    }
}

impl From<Vec<f64>> for WireValue {
    fn from(values: Vec<f64>) -> Self {
        WireValue::DoubleList(values)
    }
}

impl From<Tensor> for WireValue {
    fn from(tensor: Tensor) -> Self {
        WireValue::Tensor(tensor)
    }
}

impl From<()> for WireValue {
    fn from(_: ()) -> Self {
        WireValue::None
    }
}

/// The declared type of an argument or a return value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Any,
    None,
    Bool,
    Int,
    Float,
    String,
    Tensor,
    List(Box<ValueType>),
    Tuple(Vec<ValueType>),
    Dict(Box<ValueType>, Box<ValueType>),
    Optional(Box<ValueType>),
}

impl ValueType {
    /// Whether `value` is an instance of this type.
    pub fn admits(&self, value: &WireValue) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (ValueType::Optional(_), WireValue::None) => true,
            (ValueType::Optional(inner), value) => inner.admits(value),
            (ValueType::None, WireValue::None) => true,
            (ValueType::Bool, WireValue::Bool(_)) => true,
            (ValueType::Int, WireValue::Int(_)) => true,
            (ValueType::Float, WireValue::Double(_)) => true,
            (ValueType::String, WireValue::String(_)) => true,
            (ValueType::Tensor, WireValue::Tensor(_)) => true,
            (ValueType::List(elem), WireValue::IntList(values)) => values
                .iter()
                .all(|value| elem.admits(&WireValue::Int(*value))),
            (ValueType::List(elem), WireValue::DoubleList(values)) => values
                .iter()
                .all(|value| elem.admits(&WireValue::Double(*value))),
            (ValueType::List(elem), WireValue::List(values)) => {
                values.iter().all(|value| elem.admits(value))
            }
            (ValueType::Tuple(elems), WireValue::Tuple(values)) => {
                elems.len() == values.len()
                    && elems.iter().zip(values).all(|(ty, value)| ty.admits(value))
            }
            (ValueType::Dict(key, value), WireValue::Dict(entries)) => entries
                .iter()
                .all(|(k, v)| key.admits(k) && value.admits(v)),
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Any => write!(f, "Any"),
            ValueType::None => write!(f, "NoneType"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::String => write!(f, "str"),
            ValueType::Tensor => write!(f, "Tensor"),
            ValueType::List(elem) => write!(f, "List[{}]", elem),
            ValueType::Tuple(elems) => {
                let elems: Vec<String> = elems.iter().map(ToString::to_string).collect();
                write!(f, "Tuple[{}]", elems.join(", "))
            }
            ValueType::Dict(key, value) => write!(f, "Dict[{}, {}]", key, value),
            ValueType::Optional(inner) => write!(f, "Optional[{}]", inner),
        }
    }
}

impl FromStr for ValueType {
    type Err = ParserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser::new(s, TYPE_DELIMS);
        let ty = parse_type(&mut parser)?;
        parser.expect_end()?;
        Ok(ty)
    }
}

pub(crate) const TYPE_DELIMS: &[&str] = &["[", "]", ",", "?", "(", ")", "->"];

/// Parse a single type expression, e.g. `Dict[str, List[int]]` or `Tensor?`.
pub(crate) fn parse_type(parser: &mut Parser<'_>) -> Result<ValueType, ParserError> {
    let name = parser.next_or_err("a type")?;
    let ty = match name {
        "Any" => ValueType::Any,
        "None" | "NoneType" => ValueType::None,
        "bool" => ValueType::Bool,
        "int" => ValueType::Int,
        "float" => ValueType::Float,
        "str" => ValueType::String,
        "Tensor" => ValueType::Tensor,
        "List" => {
            parser.expect("[")?;
            let elem = parse_type(parser)?;
            parser.expect("]")?;
            ValueType::List(Box::new(elem))
        }
        "Optional" => {
            parser.expect("[")?;
            let inner = parse_type(parser)?;
            parser.expect("]")?;
            ValueType::Optional(Box::new(inner))
        }
        "Dict" => {
            parser.expect("[")?;
            let key = parse_type(parser)?;
            parser.expect(",")?;
            let value = parse_type(parser)?;
            parser.expect("]")?;
            ValueType::Dict(Box::new(key), Box::new(value))
        }
        "Tuple" => {
            parser.expect("[")?;
            let mut elems = Vec::new();
            if parser.peek() != Some("]") {
                loop {
                    elems.push(parse_type(parser)?);
                    if parser.peek() == Some(",") {
                        parser.expect(",")?;
                    } else {
                        break;
                    }
                }
            }
            parser.expect("]")?;
            ValueType::Tuple(elems)
        }
        other => {
            return Err(ParserError::WrongTokenType {
                expected_type: "type",
                actual: other.to_string(),
            });
        }
    };
    if parser.peek() == Some("?") {
        parser.expect("?")?;
        return Ok(ValueType::Optional(Box::new(ty)));
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types() {
        assert_eq!("int".parse::<ValueType>().unwrap(), ValueType::Int);
        assert_eq!(
            "List[ Tensor ]".parse::<ValueType>().unwrap(),
            ValueType::List(Box::new(ValueType::Tensor))
        );
        assert_eq!(
            "Dict[str, List[float]]".parse::<ValueType>().unwrap(),
            ValueType::Dict(
                Box::new(ValueType::String),
                Box::new(ValueType::List(Box::new(ValueType::Float)))
            )
        );
        assert_eq!(
            "int?".parse::<ValueType>().unwrap(),
            ValueType::Optional(Box::new(ValueType::Int))
        );
        assert_eq!(
            "Tuple[]".parse::<ValueType>().unwrap(),
            ValueType::Tuple(vec![])
        );
        assert!("Strange".parse::<ValueType>().is_err());
        assert!("List[int".parse::<ValueType>().is_err());
        assert!("int int".parse::<ValueType>().is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for text in [
            "int",
            "List[int]",
            "Tuple[int, float, str]",
            "Dict[str, Tensor]",
            "Optional[bool]",
            "NoneType",
        ] {
            let ty: ValueType = text.parse().unwrap();
            assert_eq!(ty.to_string(), text);
        }
    }

    #[test]
    fn test_admits() {
        assert!(ValueType::Int.admits(&7i64.into()));
        assert!(!ValueType::Int.admits(&7.0f64.into()));
        assert!(!ValueType::Int.admits(&true.into()));
        assert!(ValueType::Any.admits(&WireValue::None));

        let opt = ValueType::Optional(Box::new(ValueType::Tensor));
        assert!(opt.admits(&WireValue::None));
        assert!(opt.admits(&Tensor::zeros(vec![2]).unwrap().into()));
        assert!(!opt.admits(&1i64.into()));

        let ints = ValueType::List(Box::new(ValueType::Int));
        assert!(ints.admits(&vec![1i64, 2, 3].into()));
        assert!(!ints.admits(&vec![1.0f64].into()));
        assert!(ints.admits(&WireValue::List(vec![1i64.into(), 2i64.into()])));

        let pair = ValueType::Tuple(vec![ValueType::Int, ValueType::String]);
        assert!(pair.admits(&WireValue::Tuple(vec![1i64.into(), "a".into()])));
        assert!(!pair.admits(&WireValue::Tuple(vec![1i64.into()])));

        let dict = ValueType::Dict(Box::new(ValueType::String), Box::new(ValueType::Int));
        assert!(dict.admits(&WireValue::Dict(vec![("a".into(), 1i64.into())])));
        assert!(!dict.admits(&WireValue::Dict(vec![(1i64.into(), 1i64.into())])));
    }

    #[test]
    fn test_value_type() {
        assert_eq!(
            WireValue::List(vec![1i64.into(), 2i64.into()]).value_type(),
            ValueType::List(Box::new(ValueType::Int))
        );
        assert_eq!(
            WireValue::List(vec![1i64.into(), "x".into()]).value_type(),
            ValueType::List(Box::new(ValueType::Any))
        );
        let value = WireValue::Tuple(vec![Tensor::zeros(vec![1]).unwrap().into(), 3.5f64.into()]);
        assert!(value.value_type().admits(&value));
    }

    #[test]
    fn test_tensor_shape_checked() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = Tensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(err.to_string().contains("needs 6 elements"));
        assert_eq!(Tensor::full(vec![2, 2], 1.5).unwrap().data(), &[1.5; 4]);
        assert_eq!(Tensor::zeros(vec![]).unwrap().numel(), 1);
        assert_eq!(Tensor::zeros(vec![3, 0]).unwrap().numel(), 0);
    }

    #[test]
    fn test_tensor_too_large() {
        assert!(matches!(
            Tensor::zeros(vec![usize::MAX, 2]),
            Err(ShapeError::TooLarge(_))
        ));
        assert!(matches!(
            Tensor::full(vec![1usize << 62], 1.0),
            Err(ShapeError::TooLarge(_))
        ));
        assert!(matches!(
            Tensor::new(vec![usize::MAX, usize::MAX], vec![]),
            Err(ShapeError::TooLarge(_))
        ));
    }

    #[test]
    fn test_decoded_tensor_shape_checked() {
        let good = Tensor::new(vec![2, 2], vec![1.0; 4]).unwrap();
        let bytes = bincode::serialize(&WireValue::Tensor(good.clone())).unwrap();
        assert_eq!(
            bincode::deserialize::<WireValue>(&bytes).unwrap(),
            WireValue::Tensor(good)
        );

        #[derive(Serialize)]
        struct Forged {
            shape: Vec<usize>,
            data: Vec<f64>,
        }
        let bytes = bincode::serialize(&Forged {
            shape: vec![2, 2],
            data: vec![],
        })
        .unwrap();
        let err = bincode::deserialize::<Tensor>(&bytes).unwrap_err();
        assert!(err.to_string().contains("needs 4 elements"), "{}", err);
    }
}
