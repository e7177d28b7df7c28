//! Binary wire codec for the debug server protocol
//!
//! Every message travels as a frame: a little-endian `u32` payload length
//! followed by the payload. The payload starts with a type byte and carries
//! the fields in declaration order. A zero-length frame is a ping; whoever
//! reads one answers with a zero-length pong and keeps waiting.

use std::collections::BTreeMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::*;

/// Largest payload a peer may announce
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const PING: [u8; 4] = [0, 0, 0, 0];

const CMD_EXECUTE: u8 = 0;
const CMD_FETCH_METADATA: u8 = 1;
const CMD_FETCH_RESULT_RANGE: u8 = 2;
const CMD_LIST_ENVIRONMENT_VARIABLES: u8 = 3;
const CMD_PUT_FILE: u8 = 4;
const CMD_DEPLOY: u8 = 5;
const CMD_EXCHANGE_VERSIONS: u8 = 7;

const RSP_EXECUTION_COMPLETED: u8 = 0;
const RSP_METADATA_FETCHED: u8 = 1;
const RSP_RESULT_RANGE_FETCHED: u8 = 2;
const RSP_ENVIRONMENT_VARIABLES_LISTED: u8 = 3;
const RSP_PUT_FILE: u8 = 4;
const RSP_DEPLOY: u8 = 5;
const RSP_EXCHANGE_VERSIONS: u8 = 7;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by the remote host")]
    EndOfStream,
    #[error("Unexpected command type byte: {0}")]
    UnknownCommand(u8),
    #[error("Unexpected response type byte: {0}")]
    UnknownResponse(u8),
    #[error("Unexpected {what} byte: {value}")]
    InvalidEnum { what: &'static str, value: u8 },
    #[error("Message is truncated: {needed} more bytes expected at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("String field is not valid UTF-8")]
    InvalidUtf8,
    #[error("Invalid field value: {0}")]
    InvalidValue(String),
    #[error("Frame of {0} bytes exceeds the maximum message size")]
    FrameTooLarge(usize),
    #[error("{0} trailing bytes after the message body")]
    TrailingBytes(usize),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Serializes primitive fields into a message body
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// 7 bits per byte, high bit set on every byte except the last
    pub fn write_7bit(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn write_blob(&mut self, data: &[u8]) {
        self.write_7bit(data.len() as u64);
        self.buf.extend_from_slice(data);
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_blob(value.as_bytes());
    }

    pub fn write_map(&mut self, map: &BTreeMap<String, String>) {
        self.write_7bit(map.len() as u64);
        for (key, value) in map {
            self.write_str(key);
            self.write_str(value);
        }
    }
}

/// Reads primitive fields back out of a message body
#[derive(Debug)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(|| CodecError::Truncated {
            offset: self.pos,
            needed: len,
        })?;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| CodecError::Truncated {
            offset: self.pos,
            needed: end.saturating_sub(self.buf.len()),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn read_7bit(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::InvalidValue("7-bit encoded length is too long".into()))
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_7bit()?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or_else(|| CodecError::InvalidValue(format!("length prefix {} is out of range", len)))
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_map(&mut self) -> Result<BTreeMap<String, String>> {
        let count = self.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    fn read_status<T>(&mut self, what: &'static str, from_byte: fn(u8) -> Option<T>) -> Result<T> {
        let value = self.read_u8()?;
        from_byte(value).ok_or(CodecError::InvalidEnum { what, value })
    }

    fn read_version(&mut self) -> Result<Version> {
        self.read_string()?.parse().map_err(CodecError::InvalidValue)
    }

    fn read_platform(&mut self) -> Result<Platform> {
        self.read_string()?.parse().map_err(CodecError::InvalidValue)
    }

    fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut w = MessageWriter::new();
    match command {
        Command::Execute(c) => {
            w.write_u8(CMD_EXECUTE);
            w.write_str(&c.working_directory);
            w.write_str(&c.executable);
            w.write_str(&c.arguments);
            w.write_map(&c.environment_variables);
            w.write_bool(c.run_as_administrator);
            w.write_bool(c.wait_for_completion);
            w.write_u32(c.execution_timeout_secs);
        }
        Command::FetchMetadata(c) => {
            w.write_u8(CMD_FETCH_METADATA);
            w.write_str(&c.file_path);
            w.write_bool(c.binary_output);
        }
        Command::FetchResultRange(c) => {
            w.write_u8(CMD_FETCH_RESULT_RANGE);
            w.write_str(&c.file_path);
            w.write_bool(c.binary_output);
            w.write_u32(c.byte_offset);
            w.write_u32(c.byte_count);
            w.write_u32(c.output_offset);
        }
        Command::ListEnvironmentVariables => {
            w.write_u8(CMD_LIST_ENVIRONMENT_VARIABLES);
        }
        Command::PutFile(c) => {
            w.write_u8(CMD_PUT_FILE);
            w.write_str(&c.path);
            w.write_str(&c.working_dir);
            w.write_blob(&c.data);
        }
        Command::Deploy(c) => {
            w.write_u8(CMD_DEPLOY);
            w.write_blob(&c.data);
            w.write_str(&c.destination);
        }
        Command::ExchangeVersions(c) => {
            w.write_u8(CMD_EXCHANGE_VERSIONS);
            w.write_str(&c.client_version.to_string());
            w.write_str(&c.client_platform.to_string());
        }
    }
    w.into_inner()
}

pub fn decode_command(payload: &[u8]) -> Result<Command> {
    let mut r = MessageReader::new(payload);
    let command = match r.read_u8()? {
        CMD_EXECUTE => Command::Execute(Execute {
            working_directory: r.read_string()?,
            executable: r.read_string()?,
            arguments: r.read_string()?,
            environment_variables: r.read_map()?,
            run_as_administrator: r.read_bool()?,
            wait_for_completion: r.read_bool()?,
            execution_timeout_secs: r.read_u32()?,
        }),
        CMD_FETCH_METADATA => Command::FetchMetadata(FetchMetadata {
            file_path: r.read_string()?,
            binary_output: r.read_bool()?,
        }),
        CMD_FETCH_RESULT_RANGE => Command::FetchResultRange(FetchResultRange {
            file_path: r.read_string()?,
            binary_output: r.read_bool()?,
            byte_offset: r.read_u32()?,
            byte_count: r.read_u32()?,
            output_offset: r.read_u32()?,
        }),
        CMD_LIST_ENVIRONMENT_VARIABLES => Command::ListEnvironmentVariables,
        CMD_PUT_FILE => Command::PutFile(PutFile {
            path: r.read_string()?,
            working_dir: r.read_string()?,
            data: r.read_blob()?,
        }),
        CMD_DEPLOY => Command::Deploy(Deploy {
            data: r.read_blob()?,
            destination: r.read_string()?,
        }),
        CMD_EXCHANGE_VERSIONS => Command::ExchangeVersions(ExchangeVersions {
            client_version: r.read_version()?,
            client_platform: r.read_platform()?,
        }),
        other => return Err(CodecError::UnknownCommand(other)),
    };
    r.finish()?;
    Ok(command)
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut w = MessageWriter::new();
    match response {
        Response::ExecutionCompleted(r) => {
            w.write_u8(RSP_EXECUTION_COMPLETED);
            w.write_u8(r.status.as_byte());
            w.write_i32(r.exit_code);
            w.write_str(&r.stdout);
            w.write_str(&r.stderr);
        }
        Response::MetadataFetched(r) => {
            w.write_u8(RSP_METADATA_FETCHED);
            w.write_u32(r.byte_count);
            w.write_i64(r.timestamp.0);
            w.write_u8(r.status.as_byte());
        }
        Response::ResultRangeFetched(r) => {
            w.write_u8(RSP_RESULT_RANGE_FETCHED);
            w.write_blob(&r.data);
            w.write_i64(r.timestamp.0);
            w.write_u8(r.status.as_byte());
        }
        Response::EnvironmentVariablesListed(r) => {
            w.write_u8(RSP_ENVIRONMENT_VARIABLES_LISTED);
            w.write_map(&r.variables);
        }
        Response::PutFile(r) => {
            w.write_u8(RSP_PUT_FILE);
            w.write_u8(r.status.as_byte());
        }
        Response::Deploy(r) => {
            w.write_u8(RSP_DEPLOY);
            w.write_u8(r.status.as_byte());
        }
        Response::ExchangeVersions(r) => {
            w.write_u8(RSP_EXCHANGE_VERSIONS);
            w.write_u8(r.status.as_byte());
            w.write_str(&r.server_version.to_string());
            w.write_str(&r.server_platform.to_string());
        }
    }
    w.into_inner()
}

pub fn decode_response(payload: &[u8]) -> Result<Response> {
    let mut r = MessageReader::new(payload);
    let response = match r.read_u8()? {
        RSP_EXECUTION_COMPLETED => Response::ExecutionCompleted(ExecutionCompleted {
            status: r.read_status("execution status", ExecutionStatus::from_byte)?,
            exit_code: r.read_i32()?,
            stdout: r.read_string()?,
            stderr: r.read_string()?,
        }),
        RSP_METADATA_FETCHED => {
            let byte_count = r.read_u32()?;
            let timestamp = Timestamp(r.read_i64()?);
            let status = r.read_status("fetch status", FetchStatus::from_byte)?;
            Response::MetadataFetched(MetadataFetched { status, timestamp, byte_count })
        }
        RSP_RESULT_RANGE_FETCHED => {
            let data = r.read_blob()?;
            let timestamp = Timestamp(r.read_i64()?);
            let status = r.read_status("fetch status", FetchStatus::from_byte)?;
            Response::ResultRangeFetched(ResultRangeFetched { status, timestamp, data })
        }
        RSP_ENVIRONMENT_VARIABLES_LISTED => {
            Response::EnvironmentVariablesListed(EnvironmentVariablesListed { variables: r.read_map()? })
        }
        RSP_PUT_FILE => Response::PutFile(PutFileResponse {
            status: r.read_status("write status", WriteStatus::from_byte)?,
        }),
        RSP_DEPLOY => Response::Deploy(DeployResponse {
            status: r.read_status("write status", WriteStatus::from_byte)?,
        }),
        RSP_EXCHANGE_VERSIONS => Response::ExchangeVersions(ExchangeVersionsResponse {
            status: r.read_status("version exchange status", ExchangeVersionsStatus::from_byte)?,
            server_version: r.read_version()?,
            server_platform: r.read_platform()?,
        }),
        other => return Err(CodecError::UnknownResponse(other)),
    };
    r.finish()?;
    Ok(response)
}

/// Writes one frame with a single `write_all` so a message is not split
/// across several TCP packets. Returns the number of bytes sent.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(frame.len())
}

/// Reads the next non-empty frame, answering pings along the way.
/// Returns the payload and the number of bytes read for it (prefix included).
pub async fn read_frame<S>(stream: &mut S) -> Result<(Vec<u8>, usize)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len_bytes = [0u8; 4];
        read_exact_or_eof(stream, &mut len_bytes).await?;

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            log::trace!("PING received, replying with PONG");
            stream.write_all(&PING).await?;
            stream.flush().await?;
            continue;
        }
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        read_exact_or_eof(stream, &mut payload).await?;
        return Ok((payload, len + 4));
    }
}

async fn read_exact_or_eof<R>(stream: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::EndOfStream),
        Err(e) => Err(CodecError::Io(e)),
    }
}

pub async fn write_command<W>(stream: &mut W, command: &Command) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    write_frame(stream, &encode_command(command)).await
}

pub async fn read_response<S>(stream: &mut S) -> Result<(Response, usize)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (payload, bytes) = read_frame(stream).await?;
    Ok((decode_response(&payload)?, bytes))
}

/// Server side of the exchange, used by test servers and tooling
pub async fn read_command<S>(stream: &mut S) -> Result<(Command, usize)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (payload, bytes) = read_frame(stream).await?;
    Ok((decode_command(&payload)?, bytes))
}

pub async fn write_response<W>(stream: &mut W, response: &Response) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    write_frame(stream, &encode_response(response)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_7bit_length_prefix() {
        let mut w = MessageWriter::new();
        w.write_7bit(300);
        let bytes = w.into_inner();
        assert_eq!(bytes, vec![0xAC, 0x02]);
        assert_eq!(MessageReader::new(&bytes).read_7bit().unwrap(), 300);
    }

    #[test]
    fn test_fetch_result_range_layout() {
        let command = Command::FetchResultRange(FetchResultRange {
            file_path: "a".into(),
            binary_output: true,
            byte_offset: 1,
            byte_count: 2,
            output_offset: 3,
        });
        let bytes = encode_command(&command);
        assert_eq!(
            bytes,
            vec![2, 1, b'a', 1, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0]
        );
        assert_eq!(decode_command(&bytes).unwrap(), command);
    }

    #[test]
    fn test_decode_execution_completed() {
        let response = Response::ExecutionCompleted(ExecutionCompleted {
            status: ExecutionStatus::Completed,
            exit_code: -1,
            stdout: "out".into(),
            stderr: String::new(),
        });
        let bytes = encode_response(&response);
        assert_eq!(decode_response(&bytes).unwrap(), response);
    }

    #[test]
    fn test_decode_every_response_kind() {
        let mut variables = BTreeMap::new();
        variables.insert("HOME".to_string(), "/home/dev".to_string());
        let responses = vec![
            Response::ExecutionCompleted(ExecutionCompleted {
                status: ExecutionStatus::TimedOut,
                exit_code: 0,
                stdout: String::new(),
                stderr: "killed".into(),
            }),
            Response::MetadataFetched(MetadataFetched {
                status: FetchStatus::Successful,
                timestamp: Timestamp(42),
                byte_count: 1024,
            }),
            Response::ResultRangeFetched(ResultRangeFetched {
                status: FetchStatus::Successful,
                timestamp: Timestamp(-7),
                data: vec![1, 2, 3, 4],
            }),
            Response::EnvironmentVariablesListed(EnvironmentVariablesListed { variables }),
            Response::PutFile(PutFileResponse { status: WriteStatus::Successful }),
            Response::Deploy(DeployResponse { status: WriteStatus::OtherIOError }),
            Response::ExchangeVersions(ExchangeVersionsResponse {
                status: ExchangeVersionsStatus::Successful,
                server_version: CLIENT_VERSION,
                server_platform: Platform::Windows,
            }),
        ];
        for response in responses {
            let decoded = decode_response(&encode_response(&response))
                .unwrap_or_else(|e| panic!("{} failed to decode: {}", response.kind(), e));
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn test_truncation_reports_missing_bytes() {
        let mut r = MessageReader::new(&[1, 2]);
        assert_eq!(r.read_u8().unwrap(), 1);
        match r.read_u32() {
            Err(CodecError::Truncated { offset, needed }) => assert_eq!((offset, needed), (1, 3)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_truncation() {
        assert!(matches!(decode_response(&[42]), Err(CodecError::UnknownResponse(42))));
        assert!(matches!(decode_command(&[9]), Err(CodecError::UnknownCommand(9))));

        // MetadataFetched with a byte count but no timestamp
        let truncated = [RSP_METADATA_FETCHED, 16, 0, 0, 0, 1];
        assert!(matches!(decode_response(&truncated), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_rejects_bad_status_byte() {
        let bytes = [RSP_PUT_FILE, 9];
        assert!(matches!(
            decode_response(&bytes),
            Err(CodecError::InvalidEnum { value: 9, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let bytes = [CMD_LIST_ENVIRONMENT_VARIABLES, 0];
        assert!(matches!(decode_command(&bytes), Err(CodecError::TrailingBytes(1))));
    }

    #[tokio::test]
    async fn test_read_frame_answers_ping() {
        let payload = encode_response(&Response::PutFile(PutFileResponse {
            status: WriteStatus::PermissionDenied,
        }));
        let mut framed = (payload.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(&payload);

        let mut stream = tokio_test::io::Builder::new()
            .read(&PING)
            .write(&PING)
            .read(&framed)
            .build();

        let (response, bytes) = read_response(&mut stream).await.unwrap();
        assert_eq!(bytes, framed.len());
        assert_eq!(
            response,
            Response::PutFile(PutFileResponse { status: WriteStatus::PermissionDenied })
        );
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        let mut stream = tokio_test::io::Builder::new().read(&[5, 0]).build();
        assert!(matches!(read_frame(&mut stream).await, Err(CodecError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_write_frame_prefixes_length() {
        let command = Command::ListEnvironmentVariables;
        let mut stream = tokio_test::io::Builder::new()
            .write(&[1, 0, 0, 0, CMD_LIST_ENVIRONMENT_VARIABLES])
            .build();
        let sent = write_command(&mut stream, &command).await.unwrap();
        assert_eq!(sent, 5);
    }
}
