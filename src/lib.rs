//! XML-RPC runtime pieces: the value model and its XML wire codec,
//! and the per-socket connection engine that feeds an HTTP server.
//!
//! The codec side works on in-memory buffers and is usable on its
//! own:
//!
//! ```
//! use libxmlrpc_rs::{parse_value, Serializer, Value};
//!
//! let mut buf = Vec::new();
//! let val = Value::Array(vec![Value::Int(7), Value::string("seven")]);
//! Serializer::new().write_value(&mut buf, &val).unwrap();
//! assert_eq!(parse_value(&buf).unwrap(), val);
//! ```
//!
//! The connection side reads framed HTTP headers from a socket under
//! a deadline and runs one job per connection, on the caller's thread
//! or on a worker. What the job does with the bytes (routing, method
//! dispatch, static files) belongs to the layers above.

pub mod builder;
pub mod common;
pub mod connection;
pub mod constants;
pub mod serialize;
pub mod socket;
pub mod tokenizer;
pub mod value_tree_builder;

pub use common::{DateTime, Fault, FaultKind, Value, ValueType};
pub use connection::{Conn, ConnHandle, ConnMode, ServerConfig};
pub use serialize::{Dialect, Serializer};
pub use socket::{Socket, TcpSocket, WaitResult};
pub use value_tree_builder::{parse_call, parse_response, parse_value, Response};
