use crate::drivers::tcp;
use crate::error::DriverError;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Largest bulk string accepted from a server (512 MiB, the RESP limit)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest array accepted from a server
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Deepest array nesting accepted from a server
pub const MAX_DEPTH: usize = 32;

/// A decoded RESP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

/// Blocking RESP connection to a key-value cache
pub struct RespConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl RespConnection {
    /// Connect within `timeout`; the same timeout bounds every reply
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, DriverError> {
        let writer = tcp::connect(host, port, timeout)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { reader, writer })
    }

    /// Send one command and read its reply
    ///
    /// # Errors
    ///
    /// Error replies from the server become `DriverError::Server`.
    pub fn command(&mut self, args: &[&str]) -> Result<RespValue, DriverError> {
        self.writer.write_all(&encode_command(args))?;
        self.writer.flush()?;
        match read_value(&mut self.reader)? {
            RespValue::Error(message) => Err(DriverError::Server(message)),
            value => Ok(value),
        }
    }

    pub fn ping(&mut self) -> Result<(), DriverError> {
        match self.command(&["PING"])? {
            RespValue::Simple(ref s) if s == "PONG" => Ok(()),
            other => Err(DriverError::Protocol(format!(
                "unexpected PING reply: {:?}",
                other
            ))),
        }
    }

    pub fn auth(&mut self, password: &str) -> Result<(), DriverError> {
        self.expect_ok(&["AUTH", password])
    }

    pub fn select(&mut self, database: u8) -> Result<(), DriverError> {
        let index = database.to_string();
        self.expect_ok(&["SELECT", &index])
    }

    pub fn flush_db(&mut self) -> Result<(), DriverError> {
        self.expect_ok(&["FLUSHDB"])
    }

    fn expect_ok(&mut self, args: &[&str]) -> Result<(), DriverError> {
        match self.command(args)? {
            RespValue::Simple(ref s) if s == "OK" => Ok(()),
            other => Err(DriverError::Protocol(format!(
                "unexpected {} reply: {:?}",
                args[0], other
            ))),
        }
    }
}

impl Drop for RespConnection {
    fn drop(&mut self) {
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn read_line(reader: &mut impl BufRead) -> Result<String, DriverError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(DriverError::Protocol("connection closed by server".to_string()));
    }
    if !line.ends_with("\r\n") {
        return Err(DriverError::Protocol(format!("unterminated line: {:?}", line)));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_length(text: &str) -> Result<i64, DriverError> {
    text.parse::<i64>()
        .map_err(|_| DriverError::Protocol(format!("invalid length: {:?}", text)))
}

fn bounded_length(text: &str, max: i64, what: &str) -> Result<i64, DriverError> {
    let len = parse_length(text)?;
    if len > max {
        return Err(DriverError::Protocol(format!(
            "{} length {} exceeds the limit of {}",
            what, len, max
        )));
    }
    Ok(len)
}

/// Decode one reply
///
/// Length prefixes above [`MAX_BULK_LEN`] and [`MAX_ARRAY_LEN`], and arrays
/// nested deeper than [`MAX_DEPTH`], are rejected as protocol errors.
pub fn read_value(reader: &mut impl BufRead) -> Result<RespValue, DriverError> {
    read_nested(reader, 0)
}

fn read_nested(reader: &mut impl BufRead, depth: usize) -> Result<RespValue, DriverError> {
    let line = read_line(reader)?;
    let mut chars = line.chars();
    let kind = chars.next();
    let rest = chars.as_str();
    match kind {
        Some('+') => Ok(RespValue::Simple(rest.to_string())),
        Some('-') => Ok(RespValue::Error(rest.to_string())),
        Some(':') => Ok(RespValue::Integer(parse_length(rest)?)),
        Some('$') => {
            let len = bounded_length(rest, MAX_BULK_LEN, "bulk string")?;
            if len < 0 {
                return Ok(RespValue::Bulk(None));
            }
            let expected = len as usize + 2;
            let mut buf = Vec::new();
            reader.by_ref().take(expected as u64).read_to_end(&mut buf)?;
            if buf.len() != expected {
                return Err(DriverError::Protocol("truncated bulk string".to_string()));
            }
            if !buf.ends_with(b"\r\n") {
                return Err(DriverError::Protocol("unterminated bulk string".to_string()));
            }
            buf.truncate(len as usize);
            Ok(RespValue::Bulk(Some(buf)))
        }
        Some('*') => {
            let len = bounded_length(rest, MAX_ARRAY_LEN, "array")?;
            if len < 0 {
                return Ok(RespValue::Array(None));
            }
            if depth >= MAX_DEPTH {
                return Err(DriverError::Protocol(format!(
                    "arrays nested deeper than {}",
                    MAX_DEPTH
                )));
            }
            // Capacity grows with the data actually received
            let mut items = Vec::with_capacity(len.min(64) as usize);
            for _ in 0..len {
                items.push(read_nested(reader, depth + 1)?);
            }
            Ok(RespValue::Array(Some(items)))
        }
        _ => Err(DriverError::Protocol(format!("unknown reply type: {:?}", line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(&["AUTH", "pw"]),
            b"*2\r\n$4\r\nAUTH\r\n$2\r\npw\r\n".to_vec()
        );
    }

    #[test]
    fn test_read_values() {
        let mut input = Cursor::new(
            b"+PONG\r\n-ERR bad\r\n:42\r\n$3\r\nabc\r\n$-1\r\n*2\r\n+OK\r\n:1\r\n".to_vec(),
        );
        assert_eq!(read_value(&mut input).unwrap(), RespValue::Simple("PONG".into()));
        assert_eq!(read_value(&mut input).unwrap(), RespValue::Error("ERR bad".into()));
        assert_eq!(read_value(&mut input).unwrap(), RespValue::Integer(42));
        assert_eq!(
            read_value(&mut input).unwrap(),
            RespValue::Bulk(Some(b"abc".to_vec()))
        );
        assert_eq!(read_value(&mut input).unwrap(), RespValue::Bulk(None));
        assert_eq!(
            read_value(&mut input).unwrap(),
            RespValue::Array(Some(vec![
                RespValue::Simple("OK".into()),
                RespValue::Integer(1)
            ]))
        );
    }

    #[test]
    fn test_read_rejects_garbage() {
        let mut input = Cursor::new(b"?what\r\n".to_vec());
        assert!(matches!(read_value(&mut input), Err(DriverError::Protocol(_))));

        let mut closed = Cursor::new(Vec::new());
        assert!(matches!(read_value(&mut closed), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_oversized_lengths_are_protocol_errors() {
        let mut array = Cursor::new(b"*9223372036854775807\r\n".to_vec());
        assert!(matches!(read_value(&mut array), Err(DriverError::Protocol(_))));

        let mut bulk = Cursor::new(b"$9223372036854775807\r\n".to_vec());
        assert!(matches!(read_value(&mut bulk), Err(DriverError::Protocol(_))));

        let mut over = Cursor::new(format!("${}\r\n", MAX_BULK_LEN + 1).into_bytes());
        assert!(matches!(read_value(&mut over), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_truncated_array_fails_cleanly() {
        // Claims a million items but carries one
        let mut input = Cursor::new(format!("*{}\r\n:1\r\n", MAX_ARRAY_LEN).into_bytes());
        assert!(matches!(read_value(&mut input), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut input = Cursor::new("*1\r\n".repeat(MAX_DEPTH + 1).into_bytes());
        assert!(matches!(read_value(&mut input), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_ping_and_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut writer = socket;
            // PING
            read_value(&mut reader).unwrap();
            writer.write_all(b"+PONG\r\n").unwrap();
            // AUTH
            read_value(&mut reader).unwrap();
            writer.write_all(b"-WRONGPASS invalid password\r\n").unwrap();
        });

        let mut conn = RespConnection::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        conn.ping().unwrap();
        match conn.auth("nope") {
            Err(DriverError::Server(message)) => assert!(message.starts_with("WRONGPASS")),
            other => panic!("expected server error, got {:?}", other),
        }
        server.join().unwrap();
    }
}
