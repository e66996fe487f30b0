//! RESP2 encoding and decoding.

use crate::error::{MuxError, Result};
use std::io::{BufRead, Read, Write};

/// Largest bulk string accepted from the server (512MB, the protocol limit).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// A decoded RESP2 reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Null bulk string or null array.
    Nil,
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Value>),
}

impl Value {
    /// Convert an error reply into `MuxError::Store`, pass anything else through.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Value::Error(msg) => Err(MuxError::Store(msg)),
            other => Ok(other),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Value::Bulk(bytes) => Ok(bytes),
            Value::Simple(s) => Ok(s.into_bytes()),
            other => Err(unexpected("bulk string", &other)),
        }
    }

    pub fn into_string(self) -> Result<String> {
        String::from_utf8(self.into_bytes()?)
            .map_err(|e| MuxError::Protocol(format!("non UTF-8 string: {}", e)))
    }

    pub fn into_array(self) -> Result<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn as_integer(&self) -> Result<i64> {
        match self {
            Value::Integer(n) => Ok(*n),
            other => Err(unexpected("integer", other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Value) -> MuxError {
    MuxError::Protocol(format!("expected {}, got {:?}", wanted, got))
}

/// Write one command as an array of bulk strings.
pub fn write_command<W: Write>(w: &mut W, args: &[&[u8]]) -> Result<()> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Read one reply.
pub fn read_value<R: BufRead>(r: &mut R) -> Result<Value> {
    let line = read_line(r)?;
    let (kind, rest) = line
        .split_first()
        .ok_or_else(|| MuxError::Protocol("empty reply line".into()))?;
    let rest = std::str::from_utf8(rest)
        .map_err(|e| MuxError::Protocol(format!("non UTF-8 header: {}", e)))?;

    match kind {
        b'+' => Ok(Value::Simple(rest.to_string())),
        b'-' => Ok(Value::Error(rest.to_string())),
        b':' => Ok(Value::Integer(parse_int(rest)?)),
        b'$' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Value::Nil);
            }
            if len > MAX_BULK_LEN {
                return Err(MuxError::Protocol(format!("bulk length {} too large", len)));
            }
            let mut data = vec![0u8; len as usize + 2];
            r.read_exact(&mut data)?;
            if &data[len as usize..] != b"\r\n" {
                return Err(MuxError::Protocol("bulk string not terminated".into()));
            }
            data.truncate(len as usize);
            Ok(Value::Bulk(data))
        }
        b'*' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Value::Nil);
            }
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(read_value(r)?);
            }
            Ok(Value::Array(items))
        }
        other => Err(MuxError::Protocol(format!(
            "unknown reply type byte {:?}",
            *other as char
        ))),
    }
}

fn read_line<R: BufRead>(r: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = r.read_until(b'\n', &mut line)?;
    if n == 0 {
        return Err(MuxError::StoreUnavailable("connection closed by server".into()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(MuxError::Protocol("reply line not terminated".into()));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|_| MuxError::Protocol(format!("invalid integer {:?}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(bytes: &[u8]) -> Result<Value> {
        read_value(&mut Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn test_write_command() {
        let mut out = Vec::new();
        let args: [&[u8]; 5] = [b"XADD", b"orders", b"*", b"CREATED", b"{}"];
        write_command(&mut out, &args).unwrap();
        assert_eq!(
            out,
            b"*5\r\n$4\r\nXADD\r\n$6\r\norders\r\n$1\r\n*\r\n$7\r\nCREATED\r\n$2\r\n{}\r\n".to_vec()
        );
    }

    #[test]
    fn test_read_scalars() {
        assert_eq!(decode(b"+OK\r\n").unwrap(), Value::Simple("OK".into()));
        assert_eq!(decode(b":42\r\n").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"$-1\r\n").unwrap(), Value::Nil);
        assert_eq!(decode(b"*-1\r\n").unwrap(), Value::Nil);
        assert_eq!(decode(b"$3\r\nfoo\r\n").unwrap(), Value::Bulk(b"foo".to_vec()));
        assert!(matches!(
            decode(b"-ERR unknown\r\n").unwrap().into_result(),
            Err(MuxError::Store(msg)) if msg == "ERR unknown"
        ));
    }

    #[test]
    fn test_read_nested_xread_reply() {
        let reply = b"*1\r\n*2\r\n$6\r\norders\r\n*1\r\n*2\r\n$3\r\n1-0\r\n*2\r\n$7\r\nCREATED\r\n$8\r\n{\"id\":1}\r\n";
        let value = decode(reply).unwrap();
        let streams = value.into_array().unwrap();
        assert_eq!(streams.len(), 1);
        let pair = streams[0].clone().into_array().unwrap();
        assert_eq!(pair[0].clone().into_string().unwrap(), "orders");
    }

    #[test]
    fn test_closed_connection() {
        assert!(matches!(decode(b""), Err(MuxError::StoreUnavailable(_))));
        assert!(matches!(decode(b"$5\r\nab"), Err(MuxError::Io(_))));
        assert!(matches!(decode(b"?x\r\n"), Err(MuxError::Protocol(_))));
    }
}
