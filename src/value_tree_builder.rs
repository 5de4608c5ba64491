use std::fmt;

use crate::common::{DateTime, Fault, Value};
use crate::constants::*;
use crate::tokenizer::{Callback, Tokenizer};

/// What kind of document the parse produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedStatus {
    Init,
    Response,
    Fault,
    MethodCall(String),
}

/// Outcome of parsing a methodResponse document.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(Value),
    Failure(Fault),
}

#[derive(Debug)]
enum Frame {
    Array(Vec<Value>),
    // members collected so far plus the key awaiting its value
    Struct(Vec<(String, Value)>, Option<String>),
}

/// Assembles parse events into a value tree.
#[derive(Debug)]
pub struct ValueTreeBuilder {
    /// What was parsed from the document.
    pub what: ParsedStatus,

    /// Result values; one per parameter for a call, a single element
    /// for a response or a bare value.
    pub values: Vec<Value>,

    stack: Vec<Frame>,
}

impl ValueTreeBuilder {
    pub fn new() -> ValueTreeBuilder {
        ValueTreeBuilder {
            what: ParsedStatus::Init,
            values: vec![],
            stack: vec![],
        }
    }

    fn append_to_last(&mut self, v: Value) {
        match self.stack.last_mut() {
            Some(Frame::Array(arr)) => arr.push(v),
            Some(Frame::Struct(members, key)) => {
                // the tokenizer delivers struct_key before each value
                let name = key.take().unwrap_or_default();
                members.push((name, v));
            }
            None => self.values.push(v),
        }
    }
}

impl Default for ValueTreeBuilder {
    fn default() -> ValueTreeBuilder {
        ValueTreeBuilder::new()
    }
}

impl fmt::Display for ValueTreeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.what {
            ParsedStatus::Init => f.write_str("value(")?,
            ParsedStatus::Response => f.write_str("response(")?,
            ParsedStatus::Fault => f.write_str("fault(")?,
            ParsedStatus::MethodCall(name) => write!(f, "method {}(", name)?,
        }
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", v)?;
        }
        f.write_str(")")
    }
}

impl Callback for ValueTreeBuilder {
    fn call(&mut self, method: &str) -> bool {
        self.what = ParsedStatus::MethodCall(method.to_owned());
        true
    }

    fn response(&mut self) -> bool {
        self.what = ParsedStatus::Response;
        true
    }

    fn fault(&mut self) -> bool {
        self.what = ParsedStatus::Fault;
        true
    }

    fn integer(&mut self, v: i32) -> bool {
        self.append_to_last(Value::Int(v));
        true
    }

    fn integer64(&mut self, v: i64) -> bool {
        self.append_to_last(Value::Int64(v));
        true
    }

    fn boolean(&mut self, v: bool) -> bool {
        self.append_to_last(Value::Bool(v));
        true
    }

    fn double_number(&mut self, v: f64) -> bool {
        self.append_to_last(Value::Double(v));
        true
    }

    fn string_value(&mut self, v: String) -> bool {
        self.append_to_last(Value::Str(v));
        true
    }

    fn datetime(&mut self, v: DateTime) -> bool {
        self.append_to_last(Value::DateTime(v));
        true
    }

    fn binary(&mut self, v: Vec<u8>) -> bool {
        self.append_to_last(Value::Binary(v));
        true
    }

    fn null(&mut self) -> bool {
        self.append_to_last(Value::Null);
        true
    }

    fn array_begin(&mut self) -> bool {
        self.stack.push(Frame::Array(vec![]));
        true
    }

    fn struct_begin(&mut self) -> bool {
        self.stack.push(Frame::Struct(vec![], None));
        true
    }

    fn struct_key(&mut self, name: String) -> bool {
        match self.stack.last_mut() {
            Some(Frame::Struct(_, key)) => {
                *key = Some(name);
                true
            }
            _ => false,
        }
    }

    fn value_end(&mut self) -> bool {
        match self.stack.pop() {
            Some(Frame::Array(arr)) => {
                self.append_to_last(Value::Array(arr));
                true
            }
            Some(Frame::Struct(members, _)) => {
                self.append_to_last(Value::Struct(members));
                true
            }
            None => false,
        }
    }
}

/** Decodes a bare `<value>` document. */
pub fn parse_value(xml: &[u8]) -> Result<Value, Fault> {
    let mut builder = ValueTreeBuilder::new();
    Tokenizer::new(xml).parse(&mut builder)?;
    match builder.what {
        ParsedStatus::Init => builder
            .values
            .pop()
            .ok_or_else(|| Fault::parse_error("document holds no value")),
        _ => Err(Fault::parse_error("expected a bare value document")),
    }
}

/** Decodes a methodCall document into the method name and its
 * parameter values.
 */
pub fn parse_call(xml: &[u8]) -> Result<(String, Vec<Value>), Fault> {
    let mut builder = ValueTreeBuilder::new();
    Tokenizer::new(xml).parse(&mut builder)?;
    match builder.what {
        ParsedStatus::MethodCall(method) => Ok((method, builder.values)),
        _ => Err(Fault::parse_error("document is not a methodCall")),
    }
}

/** Decodes a methodResponse document. A fault response is returned as
 * [`Response::Failure`] carrying the peer's faultCode/faultString.
 */
pub fn parse_response(xml: &[u8]) -> Result<Response, Fault> {
    let mut builder = ValueTreeBuilder::new();
    Tokenizer::new(xml).parse(&mut builder)?;
    let value = builder
        .values
        .pop()
        .ok_or_else(|| Fault::parse_error("response holds no value"))?;

    match builder.what {
        ParsedStatus::Response => Ok(Response::Success(value)),
        ParsedStatus::Fault => {
            let code = value
                .struct_get(FAULT_CODE_MEMBER)
                .and_then(Value::as_int)
                .map_err(|_| Fault::parse_error("fault response lacks an i4 faultCode"))?;
            let message = value
                .struct_get(FAULT_STRING_MEMBER)
                .and_then(Value::as_str)
                .map_err(|_| Fault::parse_error("fault response lacks a string faultString"))?;
            Ok(Response::Failure(Fault::new(code, message)))
        }
        _ => Err(Fault::parse_error("document is not a methodResponse")),
    }
}
