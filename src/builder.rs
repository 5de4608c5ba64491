//! Template-driven construction and extraction of value graphs.
//!
//! A format string declares one value per character: `i` int32,
//! `I` int64, `b` bool, `d` double, `s` string, `8` date-time text,
//! `6` base64 payload, `n` nil, `(`...`)` array, `{s:X, ...}` struct,
//! `A`/`S`/`V` substitution of a pre-built array/struct/any value.
//! Arguments are consumed left to right from a sum-typed list.

use std::vec;

use crate::common::{valid_member_name, DateTime, Fault, Value};
use crate::constants::MAX_NEST_DEPTH;

/// One argument consumed by [`build`] or produced by [`extract`].
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Int(i32),
    Int64(i64),
    Bool(bool),
    Double(f64),
    Str(String),
    Base64(Vec<u8>),
    Value(Value),
}

struct Fmt<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Fmt<'a> {
    fn new(text: &'a str) -> Fmt<'a> {
        Fmt {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn skip_separators(&mut self) {
        while let Some(b) = self.peek() {
            if b == b',' || b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }
}

/** Builds a value graph from a format string and its arguments.
 * Every format character and every argument must be consumed.
 */
pub fn build(fmt: &str, items: Vec<Item>) -> Result<Value, Fault> {
    let mut cursor = Fmt::new(fmt);
    let mut items = items.into_iter();

    let value = build_one(&mut cursor, &mut items, 0)?;

    cursor.skip_separators();
    if cursor.peek().is_some() {
        return Err(Fault::internal(format!(
            "format string has trailing content: {:?}",
            fmt
        )));
    }
    if items.next().is_some() {
        return Err(Fault::internal("unconsumed build arguments"));
    }
    Ok(value)
}

fn take_item(items: &mut vec::IntoIter<Item>, ch: u8) -> Result<Item, Fault> {
    items.next().ok_or_else(|| {
        Fault::internal(format!("format char '{}' has no argument", ch as char))
    })
}

fn argument_mismatch(ch: u8, item: &Item) -> Fault {
    Fault::type_error(format!(
        "format char '{}' does not accept {:?}",
        ch as char, item
    ))
}

fn build_one(
    fmt: &mut Fmt,
    items: &mut vec::IntoIter<Item>,
    depth: usize,
) -> Result<Value, Fault> {
    if depth > MAX_NEST_DEPTH {
        return Err(Fault::limit_exceeded(format!(
            "format nested deeper than {} levels",
            MAX_NEST_DEPTH
        )));
    }

    let ch = fmt
        .next()
        .ok_or_else(|| Fault::internal("truncated format string"))?;

    match ch {
        b'i' => match take_item(items, ch)? {
            Item::Int(v) => Ok(Value::Int(v)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'I' => match take_item(items, ch)? {
            Item::Int64(v) => Ok(Value::Int64(v)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'b' => match take_item(items, ch)? {
            Item::Bool(v) => Ok(Value::Bool(v)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'd' => match take_item(items, ch)? {
            Item::Double(v) => Ok(Value::Double(v)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b's' => match take_item(items, ch)? {
            Item::Str(v) => Ok(Value::string(&v)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'8' => match take_item(items, ch)? {
            Item::Str(v) => Ok(Value::DateTime(DateTime::new(&v)?)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'6' => match take_item(items, ch)? {
            Item::Base64(v) => Ok(Value::Binary(v)),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'n' => Ok(Value::Null),
        b'(' => {
            let mut elements = Vec::new();
            loop {
                fmt.skip_separators();
                match fmt.peek() {
                    Some(b')') => {
                        fmt.next();
                        break;
                    }
                    Some(_) => elements.push(build_one(fmt, items, depth + 1)?),
                    None => return Err(Fault::internal("unterminated array format")),
                }
            }
            Ok(Value::Array(elements))
        }
        b'{' => {
            let mut members = Vec::new();
            loop {
                fmt.skip_separators();
                match fmt.next() {
                    Some(b'}') => break,
                    Some(b's') => {
                        if fmt.next() != Some(b':') {
                            return Err(Fault::internal(
                                "struct format member needs 's:' before its value",
                            ));
                        }
                        let name = match take_item(items, b's')? {
                            Item::Str(v) => v,
                            other => return Err(argument_mismatch(b's', &other)),
                        };
                        if !valid_member_name(&name) {
                            return Err(Fault::type_error(format!(
                                "invalid struct member name: {:?}",
                                name
                            )));
                        }
                        let value = build_one(fmt, items, depth + 1)?;
                        members.push((name, value));
                    }
                    Some(other) => {
                        return Err(Fault::internal(format!(
                            "unexpected '{}' in struct format",
                            other as char
                        )))
                    }
                    None => return Err(Fault::internal("unterminated struct format")),
                }
            }
            Ok(Value::Struct(members))
        }
        b'A' => match take_item(items, ch)? {
            Item::Value(v @ Value::Array(_)) => Ok(v),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'S' => match take_item(items, ch)? {
            Item::Value(v @ Value::Struct(_)) => Ok(v),
            other => Err(argument_mismatch(ch, &other)),
        },
        b'V' => match take_item(items, ch)? {
            Item::Value(v) => Ok(v),
            other => Err(argument_mismatch(ch, &other)),
        },
        other => Err(Fault::internal(format!(
            "unknown format character '{}'",
            other as char
        ))),
    }
}

/** Extracts from a value graph against the same template. `names`
 * supplies the `s:` member names in template order. Outputs are
 * produced only on full success.
 */
pub fn extract(fmt: &str, names: &[&str], value: &Value) -> Result<Vec<Item>, Fault> {
    let mut cursor = Fmt::new(fmt);
    let mut names = names.iter();
    let mut out = Vec::new();

    extract_one(&mut cursor, &mut names, value, &mut out, 0)?;

    cursor.skip_separators();
    if cursor.peek().is_some() {
        return Err(Fault::internal(format!(
            "format string has trailing content: {:?}",
            fmt
        )));
    }
    if names.next().is_some() {
        return Err(Fault::internal("unconsumed member names"));
    }
    Ok(out)
}

fn extract_one(
    fmt: &mut Fmt,
    names: &mut std::slice::Iter<&str>,
    value: &Value,
    out: &mut Vec<Item>,
    depth: usize,
) -> Result<(), Fault> {
    if depth > MAX_NEST_DEPTH {
        return Err(Fault::limit_exceeded(format!(
            "format nested deeper than {} levels",
            MAX_NEST_DEPTH
        )));
    }

    let ch = fmt
        .next()
        .ok_or_else(|| Fault::internal("truncated format string"))?;

    match ch {
        b'i' => out.push(Item::Int(value.as_int()?)),
        b'I' => out.push(Item::Int64(value.as_int64()?)),
        b'b' => out.push(Item::Bool(value.as_bool()?)),
        b'd' => out.push(Item::Double(value.as_double()?)),
        b's' => out.push(Item::Str(value.as_str()?.to_owned())),
        b'8' => out.push(Item::Str(value.as_datetime()?.as_str().to_owned())),
        b'6' => out.push(Item::Base64(value.as_bytes()?.to_vec())),
        b'n' => {
            if *value != Value::Null {
                return Err(Fault::type_error(format!(
                    "value is {}, not null",
                    value.value_type()
                )));
            }
        }
        b'(' => {
            let len = value.array_len()?;
            let mut index = 0;
            loop {
                fmt.skip_separators();
                match fmt.peek() {
                    Some(b')') => {
                        fmt.next();
                        break;
                    }
                    Some(_) => {
                        let element = value.array_get(index).map_err(|_| {
                            Fault::index_error(format!(
                                "array has {} elements, format wants more",
                                len
                            ))
                        })?;
                        extract_one(fmt, names, element, out, depth + 1)?;
                        index += 1;
                    }
                    None => return Err(Fault::internal("unterminated array format")),
                }
            }
            if index != len {
                return Err(Fault::index_error(format!(
                    "array has {} elements, format consumes {}",
                    len, index
                )));
            }
        }
        b'{' => {
            value.struct_len()?;
            loop {
                fmt.skip_separators();
                match fmt.next() {
                    Some(b'}') => break,
                    Some(b's') => {
                        if fmt.next() != Some(b':') {
                            return Err(Fault::internal(
                                "struct format member needs 's:' before its value",
                            ));
                        }
                        let name = names
                            .next()
                            .ok_or_else(|| Fault::internal("missing member name"))?;
                        let member = value.struct_get(name)?;
                        extract_one(fmt, names, member, out, depth + 1)?;
                    }
                    Some(other) => {
                        return Err(Fault::internal(format!(
                            "unexpected '{}' in struct format",
                            other as char
                        )))
                    }
                    None => return Err(Fault::internal("unterminated struct format")),
                }
            }
        }
        b'A' => {
            value.array_len()?;
            out.push(Item::Value(value.clone()));
        }
        b'S' => {
            value.struct_len()?;
            out.push(Item::Value(value.clone()));
        }
        b'V' => out.push(Item::Value(value.clone())),
        other => {
            return Err(Fault::internal(format!(
                "unknown format character '{}'",
                other as char
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::common::FaultKind;

    #[test]
    fn build_mixed_array() {
        let value = build(
            "(iibbs68())",
            vec![
                Item::Int(i32::MAX),
                Item::Int(i32::MIN),
                Item::Bool(false),
                Item::Bool(true),
                Item::Str("Hello, world! <&>".to_owned()),
                Item::Base64(b"base64 data".to_vec()),
                Item::Str("19980717T14:08:55".to_owned()),
            ],
        )
        .unwrap();

        assert_eq!(
            value,
            Value::Array(vec![
                Value::Int(i32::MAX),
                Value::Int(i32::MIN),
                Value::Bool(false),
                Value::Bool(true),
                Value::string("Hello, world! <&>"),
                Value::Binary(b"base64 data".to_vec()),
                Value::DateTime(DateTime::new("19980717T14:08:55").unwrap()),
                Value::Array(vec![]),
            ])
        );
    }

    #[test]
    fn build_struct_with_two_members() {
        let value = build(
            "{s:i, s:s}",
            vec![
                Item::Str("age".to_owned()),
                Item::Int(34),
                Item::Str("name".to_owned()),
                Item::Str("rosa".to_owned()),
            ],
        )
        .unwrap();

        assert_eq!(
            value,
            Value::Struct(vec![
                ("age".to_owned(), Value::Int(34)),
                ("name".to_owned(), Value::string("rosa")),
            ])
        );
    }

    #[test]
    fn build_apache_extensions() {
        let value = build(
            "(iIn)",
            vec![Item::Int(7), Item::Int64(8)],
        )
        .unwrap();

        assert_eq!(
            value,
            Value::Array(vec![Value::Int(7), Value::Int64(8), Value::Null])
        );
    }

    #[test]
    fn build_substitutes_prebuilt_values() {
        let arr = Value::Array(vec![Value::Int(1)]);
        let value = build("(AV)", vec![
            Item::Value(arr.clone()),
            Item::Value(Value::Bool(true)),
        ])
        .unwrap();
        assert_eq!(value, Value::Array(vec![arr, Value::Bool(true)]));

        let fault = build("S", vec![Item::Value(Value::Int(1))]).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::TypeError);
    }

    #[test]
    fn build_faults_on_misuse() {
        let fault = build("i", vec![Item::Str("five".to_owned())]).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::TypeError);

        let fault = build("i", vec![]).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Internal);

        let fault = build("ii", vec![Item::Int(1), Item::Int(2)]).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Internal);

        let fault = build("q", vec![Item::Int(1)]).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Internal);

        let fault = build("(i", vec![Item::Int(1)]).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::Internal);
    }

    #[test]
    fn extract_is_symmetric_with_build() {
        let items = vec![
            Item::Int(7),
            Item::Str("hi".to_owned()),
            Item::Bool(true),
            Item::Double(2.5),
        ];
        let value = build("(isbdn)", items.clone()).unwrap();

        let out = extract("(isbdn)", &[], &value).unwrap();
        assert_eq!(out, items);
    }

    #[test]
    fn extract_struct_members_by_name() {
        let value = Value::Struct(vec![
            ("age".to_owned(), Value::Int(34)),
            ("name".to_owned(), Value::string("rosa")),
        ]);

        let out = extract("{s:s, s:i}", &["name", "age"], &value).unwrap();
        assert_eq!(
            out,
            vec![Item::Str("rosa".to_owned()), Item::Int(34)]
        );

        let fault = extract("{s:i}", &["height"], &value).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::NoSuchMember);
    }

    #[test]
    fn extract_checks_types_and_arity() {
        let value = Value::Array(vec![Value::Int(1), Value::Int(2)]);

        let fault = extract("(ib)", &[], &value).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::TypeError);

        let fault = extract("(i)", &[], &value).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::IndexError);

        let fault = extract("(iii)", &[], &value).unwrap_err();
        assert_eq!(fault.kind(), FaultKind::IndexError);
    }
}
