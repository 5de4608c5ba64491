use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::common::{Fault, Value};
use crate::constants::*;

/// Variant of the XML-RPC grammar to emit. `Original` is the baseline
/// grammar; `Apache` additionally allows `<ex:i8>` and `<ex:nil/>`.
/// The `ex:` prefix is written literally, without a namespace
/// declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Original,
    Apache,
}

fn open_tag(dst: &mut Vec<u8>, name: &str) {
    dst.push(b'<');
    dst.extend_from_slice(name.as_bytes());
    dst.push(b'>');
}

fn close_tag(dst: &mut Vec<u8>, name: &str) {
    dst.extend_from_slice(b"</");
    dst.extend_from_slice(name.as_bytes());
    dst.push(b'>');
}

/** Writes text content with `&`, `<` and `>` as entity references and
 * CR as `&#x0d;`. Everything else, NUL included, passes through.
 */
fn write_escaped(dst: &mut Vec<u8>, text: &str) {
    for &b in text.as_bytes() {
        match b {
            b'&' => dst.extend_from_slice(b"&amp;"),
            b'<' => dst.extend_from_slice(b"&lt;"),
            b'>' => dst.extend_from_slice(b"&gt;"),
            b'\r' => dst.extend_from_slice(b"&#x0d;"),
            _ => dst.push(b),
        }
    }
}

fn write_int(dst: &mut Vec<u8>, val: i32) {
    open_tag(dst, TAG_I4);
    dst.extend_from_slice(val.to_string().as_bytes());
    close_tag(dst, TAG_I4);
}

fn write_int64(dst: &mut Vec<u8>, val: i64) {
    open_tag(dst, TAG_I8);
    dst.extend_from_slice(val.to_string().as_bytes());
    close_tag(dst, TAG_I8);
}

fn write_bool(dst: &mut Vec<u8>, val: bool) {
    open_tag(dst, TAG_BOOLEAN);
    dst.push(if val { b'1' } else { b'0' });
    close_tag(dst, TAG_BOOLEAN);
}

fn write_double(dst: &mut Vec<u8>, val: f64) -> Result<(), Fault> {
    if !val.is_finite() {
        return Err(Fault::type_error(format!(
            "double {} is not serializable",
            val
        )));
    }
    open_tag(dst, TAG_DOUBLE);
    dst.extend_from_slice(val.to_string().as_bytes());
    close_tag(dst, TAG_DOUBLE);
    Ok(())
}

fn write_string(dst: &mut Vec<u8>, val: &str) {
    open_tag(dst, TAG_STRING);
    write_escaped(dst, val);
    close_tag(dst, TAG_STRING);
}

/** Writes the payload as line-wrapped MIME base64, one CRLF after
 * every line including the last.
 */
fn write_base64(dst: &mut Vec<u8>, data: &[u8]) {
    open_tag(dst, TAG_BASE64);
    dst.extend_from_slice(b"\r\n");
    if !data.is_empty() {
        let encoded = STANDARD.encode(data);
        for line in encoded.as_bytes().chunks(BASE64_LINE_WIDTH) {
            dst.extend_from_slice(line);
            dst.extend_from_slice(b"\r\n");
        }
    }
    close_tag(dst, TAG_BASE64);
}

/// Encodes values, parameter lists, calls, responses and faults into
/// an append-only byte buffer. The dialect is fixed per serializer.
///
/// Any fault aborts serialization immediately; the buffer contents
/// past the last successful call are unspecified and the caller is
/// expected to discard them.
pub struct Serializer {
    dialect: Dialect,
}

impl Serializer {
    pub fn new() -> Serializer {
        Serializer::with_dialect(Dialect::Original)
    }

    pub fn with_dialect(dialect: Dialect) -> Serializer {
        Serializer { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn require_apache(&self, element: &str) -> Result<(), Fault> {
        match self.dialect {
            Dialect::Apache => Ok(()),
            Dialect::Original => Err(Fault::type_error(format!(
                "<{}> value not serializable in this dialect",
                element
            ))),
        }
    }

    /** Writes `<value>...</value>`, no trailing newline. */
    pub fn write_value(&self, dst: &mut Vec<u8>, value: &Value) -> Result<(), Fault> {
        self.write_value_at(dst, value, 0)
    }

    fn write_value_at(&self, dst: &mut Vec<u8>, value: &Value, depth: usize) -> Result<(), Fault> {
        if depth > MAX_NEST_DEPTH {
            return Err(Fault::limit_exceeded(format!(
                "value graph deeper than {} levels",
                MAX_NEST_DEPTH
            )));
        }

        open_tag(dst, TAG_VALUE);
        match value {
            Value::Int(v) => write_int(dst, *v),
            Value::Int64(v) => {
                self.require_apache(TAG_I8)?;
                write_int64(dst, *v);
            }
            Value::Bool(v) => write_bool(dst, *v),
            Value::Double(v) => write_double(dst, *v)?,
            Value::Str(v) => write_string(dst, v),
            Value::DateTime(v) => {
                open_tag(dst, TAG_DATETIME);
                dst.extend_from_slice(v.as_str().as_bytes());
                close_tag(dst, TAG_DATETIME);
            }
            Value::Binary(v) => write_base64(dst, v),
            Value::Array(items) => {
                open_tag(dst, TAG_ARRAY);
                open_tag(dst, TAG_DATA);
                dst.extend_from_slice(b"\r\n");
                for item in items {
                    self.write_value_at(dst, item, depth + 1)?;
                    dst.extend_from_slice(b"\r\n");
                }
                close_tag(dst, TAG_DATA);
                close_tag(dst, TAG_ARRAY);
            }
            Value::Struct(members) => {
                open_tag(dst, TAG_STRUCT);
                dst.extend_from_slice(b"\r\n");
                for (name, member) in members {
                    open_tag(dst, TAG_MEMBER);
                    open_tag(dst, TAG_NAME);
                    write_escaped(dst, name);
                    close_tag(dst, TAG_NAME);
                    dst.extend_from_slice(b"\r\n");
                    self.write_value_at(dst, member, depth + 1)?;
                    close_tag(dst, TAG_MEMBER);
                    dst.extend_from_slice(b"\r\n");
                }
                close_tag(dst, TAG_STRUCT);
            }
            Value::Null => {
                self.require_apache(TAG_NIL)?;
                dst.extend_from_slice(b"<ex:nil/>");
            }
        }
        close_tag(dst, TAG_VALUE);
        Ok(())
    }

    /** Writes a `<params>` block. The input must be an Array value;
     * each element becomes one `<param>`.
     */
    pub fn write_params(&self, dst: &mut Vec<u8>, params: &Value) -> Result<(), Fault> {
        let items = match params {
            Value::Array(items) => items,
            other => {
                return Err(Fault::type_error(format!(
                    "parameter list is {}, not array",
                    other.value_type()
                )))
            }
        };

        open_tag(dst, TAG_PARAMS);
        dst.extend_from_slice(b"\r\n");
        for item in items {
            open_tag(dst, TAG_PARAM);
            self.write_value(dst, item)?;
            close_tag(dst, TAG_PARAM);
            dst.extend_from_slice(b"\r\n");
        }
        close_tag(dst, TAG_PARAMS);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }

    pub fn write_call(
        &self,
        dst: &mut Vec<u8>,
        method: &str,
        params: &Value,
    ) -> Result<(), Fault> {
        dst.extend_from_slice(XML_PROLOGUE.as_bytes());
        open_tag(dst, TAG_METHOD_CALL);
        dst.extend_from_slice(b"\r\n");
        open_tag(dst, TAG_METHOD_NAME);
        write_escaped(dst, method);
        close_tag(dst, TAG_METHOD_NAME);
        dst.extend_from_slice(b"\r\n");
        self.write_params(dst, params)?;
        close_tag(dst, TAG_METHOD_CALL);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }

    pub fn write_response(&self, dst: &mut Vec<u8>, result: &Value) -> Result<(), Fault> {
        dst.extend_from_slice(XML_PROLOGUE.as_bytes());
        open_tag(dst, TAG_METHOD_RESPONSE);
        dst.extend_from_slice(b"\r\n");
        open_tag(dst, TAG_PARAMS);
        dst.extend_from_slice(b"\r\n");
        open_tag(dst, TAG_PARAM);
        self.write_value(dst, result)?;
        close_tag(dst, TAG_PARAM);
        dst.extend_from_slice(b"\r\n");
        close_tag(dst, TAG_PARAMS);
        dst.extend_from_slice(b"\r\n");
        close_tag(dst, TAG_METHOD_RESPONSE);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }

    /** Writes a fault response carrying `{faultCode, faultString}`. */
    pub fn write_fault(&self, dst: &mut Vec<u8>, fault: &Fault) -> Result<(), Fault> {
        let detail = Value::Struct(vec![
            (FAULT_CODE_MEMBER.to_owned(), Value::Int(fault.code)),
            (FAULT_STRING_MEMBER.to_owned(), Value::string(&fault.message)),
        ]);

        dst.extend_from_slice(XML_PROLOGUE.as_bytes());
        open_tag(dst, TAG_METHOD_RESPONSE);
        dst.extend_from_slice(b"\r\n");
        open_tag(dst, TAG_FAULT);
        dst.extend_from_slice(b"\r\n");
        self.write_value(dst, &detail)?;
        dst.extend_from_slice(b"\r\n");
        close_tag(dst, TAG_FAULT);
        dst.extend_from_slice(b"\r\n");
        close_tag(dst, TAG_METHOD_RESPONSE);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

impl Default for Serializer {
    fn default() -> Serializer {
        Serializer::new()
    }
}
