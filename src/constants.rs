// Wire-level names and limits shared by the serializer and the parser.

/// Every serialized document starts with this exact prologue.
pub const XML_PROLOGUE: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n";

// Element names. Int32 always serializes as <i4>; <int> is accepted
// on decode only. The ex: elements belong to the apache dialect.
pub const TAG_VALUE: &str = "value";
pub const TAG_I4: &str = "i4";
pub const TAG_INT: &str = "int";
pub const TAG_I8: &str = "ex:i8";
pub const TAG_BOOLEAN: &str = "boolean";
pub const TAG_DOUBLE: &str = "double";
pub const TAG_STRING: &str = "string";
pub const TAG_DATETIME: &str = "dateTime.iso8601";
pub const TAG_BASE64: &str = "base64";
pub const TAG_ARRAY: &str = "array";
pub const TAG_DATA: &str = "data";
pub const TAG_STRUCT: &str = "struct";
pub const TAG_MEMBER: &str = "member";
pub const TAG_NAME: &str = "name";
pub const TAG_NIL: &str = "ex:nil";
pub const TAG_METHOD_CALL: &str = "methodCall";
pub const TAG_METHOD_NAME: &str = "methodName";
pub const TAG_METHOD_RESPONSE: &str = "methodResponse";
pub const TAG_PARAMS: &str = "params";
pub const TAG_PARAM: &str = "param";
pub const TAG_FAULT: &str = "fault";

pub const FAULT_CODE_MEMBER: &str = "faultCode";
pub const FAULT_STRING_MEMBER: &str = "faultString";

// Fault codes, following the classic xmlrpc-c numbering.
pub const FAULT_INTERNAL: i32 = -500;
pub const FAULT_TYPE: i32 = -501;
pub const FAULT_INDEX: i32 = -502;
pub const FAULT_PARSE: i32 = -503;
pub const FAULT_NETWORK: i32 = -504;
pub const FAULT_TIMEOUT: i32 = -505;
pub const FAULT_NO_SUCH_MEMBER: i32 = -506;
pub const FAULT_LIMIT_EXCEEDED: i32 = -509;

pub const MAX_STR_LENGTH: usize = 1024 * 1024 * 1024; // 1 GB
pub const MAX_BIN_LENGTH: usize = 1024 * 1024 * 1024; // 1 GB
pub const MAX_ARRAY_LENGTH: usize = 1024 * 1024; // 1 mil members
pub const MAX_STRUCT_LENGTH: usize = 1024 * 1024; // 1 mil members

/// Nesting limit for value graphs, both directions.
pub const MAX_NEST_DEPTH: usize = 64;

/// MIME base64 line width used inside <base64> elements.
pub const BASE64_LINE_WIDTH: usize = 76;

/// Connection scratch buffer. One byte is reserved for the sentinel
/// NUL kept at buffer[buffersize].
pub const BUFFER_SIZE: usize = 4096;
