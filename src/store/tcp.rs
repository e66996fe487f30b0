//! Redis-Streams connection over TCP.

use super::resp::{self, Value};
use super::{parse_client_list, ClientInfo, Connector, RawEntry, StoreConnection, StreamEntries};
use crate::error::{MuxError, Result};
use crate::types::{Endpoint, EntryId};
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

/// Opens [`TcpConnection`]s.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn StoreConnection>> {
        Ok(Box::new(TcpConnection::connect(endpoint, timeout)?))
    }
}

/// One RESP2 connection.
pub struct TcpConnection {
    endpoint: Endpoint,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    /// Read timeout for non-blocking commands.
    timeout: Duration,
}

impl TcpConnection {
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                MuxError::StoreUnavailable(format!("{} did not resolve", endpoint))
            })?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        debug!(endpoint = %endpoint, "tcp connection established");

        Ok(Self {
            endpoint: endpoint.clone(),
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream.try_clone()?),
            stream,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send a command and read its reply. Error replies become `MuxError::Store`.
    pub fn command(&mut self, args: &[&[u8]]) -> Result<Value> {
        resp::write_command(&mut self.writer, args)?;
        resp::read_value(&mut self.reader)?.into_result()
    }
}

fn parse_entry(value: Value) -> Result<RawEntry> {
    let mut parts = value.into_array()?.into_iter();
    let id = parts
        .next()
        .ok_or_else(|| MuxError::Protocol("entry without id".into()))?
        .into_string()?
        .parse()?;
    let flat = match parts.next() {
        Some(Value::Nil) | None => Vec::new(),
        Some(v) => v.into_array()?,
    };
    if flat.len() % 2 != 0 {
        return Err(MuxError::Protocol("odd number of entry fields".into()));
    }
    let mut fields = Vec::with_capacity(flat.len() / 2);
    let mut flat = flat.into_iter();
    while let (Some(field), Some(value)) = (flat.next(), flat.next()) {
        fields.push((field.into_string()?, value.into_bytes()?));
    }
    Ok(RawEntry { id, fields })
}

fn parse_read_reply(value: Value) -> Result<Option<Vec<StreamEntries>>> {
    if value == Value::Nil {
        return Ok(None);
    }
    let mut out = Vec::new();
    for stream in value.into_array()? {
        let mut pair = stream.into_array()?.into_iter();
        let (name, entries) = match (pair.next(), pair.next()) {
            (Some(name), Some(entries)) => (name, entries),
            _ => return Err(MuxError::Protocol("malformed stream reply".into())),
        };
        let entries = entries
            .into_array()?
            .into_iter()
            .map(parse_entry)
            .collect::<Result<Vec<_>>>()?;
        out.push(StreamEntries {
            stream: name.into_string()?,
            entries,
        });
    }
    Ok(Some(out))
}

impl StoreConnection for TcpConnection {
    fn append(
        &mut self,
        stream: &str,
        id: Option<EntryId>,
        fields: &[(&str, &[u8])],
    ) -> Result<EntryId> {
        let id = id.map(|id| id.to_string()).unwrap_or_else(|| "*".to_string());
        let mut args: Vec<&[u8]> = vec![&b"XADD"[..], stream.as_bytes(), id.as_bytes()];
        for (field, value) in fields {
            args.push(field.as_bytes());
            args.push(value);
        }
        self.command(&args)?.into_string()?.parse()
    }

    fn blocking_read(
        &mut self,
        cursors: &[(String, EntryId)],
        timeout_ms: u64,
    ) -> Result<Option<Vec<StreamEntries>>> {
        let timeout = timeout_ms.to_string();
        let ids: Vec<String> = cursors.iter().map(|(_, id)| id.to_string()).collect();
        let mut args: Vec<&[u8]> = vec![&b"XREAD"[..], &b"BLOCK"[..], timeout.as_bytes(), &b"STREAMS"[..]];
        args.extend(cursors.iter().map(|(stream, _)| stream.as_bytes()));
        args.extend(ids.iter().map(|id| id.as_bytes()));

        // The reply may legitimately take the whole blocking interval.
        self.stream
            .set_read_timeout(Some(Duration::from_millis(timeout_ms) + self.timeout))?;
        let reply = self.command(&args);
        self.stream.set_read_timeout(Some(self.timeout))?;

        parse_read_reply(reply?)
    }

    fn unblock(&mut self, client_id: u64) -> Result<bool> {
        let id = client_id.to_string();
        let reply = self.command(&[b"CLIENT", b"UNBLOCK", id.as_bytes()])?;
        Ok(reply.as_integer()? == 1)
    }

    fn client_id(&mut self) -> Result<u64> {
        let reply = self.command(&[b"CLIENT", b"ID"])?;
        Ok(reply.as_integer()? as u64)
    }

    fn set_name(&mut self, name: &str) -> Result<()> {
        self.command(&[b"CLIENT", b"SETNAME", name.as_bytes()])?;
        Ok(())
    }

    fn client_list(&mut self) -> Result<Vec<ClientInfo>> {
        let text = self.command(&[b"CLIENT", b"LIST"])?.into_string()?;
        Ok(parse_client_list(&text))
    }

    fn last_entry_id(&mut self, stream: &str) -> Result<Option<EntryId>> {
        let reply = self.command(&[b"XREVRANGE", stream.as_bytes(), b"+", b"-", b"COUNT", b"1"])?;
        match reply.into_array()?.into_iter().next() {
            Some(entry) => Ok(Some(parse_entry(entry)?.id)),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.command(&[b"QUIT"]);
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
