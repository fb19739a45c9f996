// SPDX-License-Identifier: MIT

//! Frame codec: length-prefixed, versioned messages over a byte stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IoContext, ProtocolError};
use crate::types::{
    Argument, ArgumentKind, BuildResponse, CompletedResponse, ResponseTag, RunRequest,
};

/// Version expected at the head of every request payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a frame payload. Anything larger is treated as a broken
/// or hostile peer rather than buffered.
pub const MAX_PAYLOAD_SIZE: u32 = 0x100_0000; // 16M

/// Read one request frame and decode it.
pub async fn read_request<R>(reader: &mut R) -> Result<RunRequest, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = read_frame(reader).await?;
    decode_request(&mut payload)
}

/// Encode one request and write it as a frame.
pub async fn write_request<W>(writer: &mut W, request: &RunRequest) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = BytesMut::new();
    payload.put_u32_le(PROTOCOL_VERSION);
    put_string(&mut payload, &request.language)?;
    put_string(&mut payload, &request.working_directory)?;
    put_string(&mut payload, &request.lib_directory)?;
    payload.put_u32_le(list_len(request.arguments.len())?);
    for argument in &request.arguments {
        payload.put_u32_le(argument.kind.into());
        put_string(&mut payload, &argument.value)?;
    }
    write_frame(writer, &payload).await
}

/// Read one response frame and decode it.
pub async fn read_response<R>(reader: &mut R) -> Result<BuildResponse, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut payload = read_frame(reader).await?;
    decode_response(&mut payload)
}

/// Encode one response and write it as a frame.
pub async fn write_response<W>(writer: &mut W, response: &BuildResponse) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = BytesMut::new();
    payload.put_u32_le(response.tag().into());
    match response {
        BuildResponse::Completed(completed) => {
            payload.put_i32_le(completed.exit_code);
            payload.put_u8(u8::from(completed.utf8_output));
            put_string(&mut payload, &completed.output)?;
            put_string(&mut payload, &completed.error_output)?;
        }
        BuildResponse::AnalyzerInconsistency { messages } => {
            payload.put_u32_le(list_len(messages.len())?);
            for message in messages {
                put_string(&mut payload, message)?;
            }
        }
        BuildResponse::Shutdown { server_pid } => {
            payload.put_u32_le(*server_pid);
        }
    }
    write_frame(writer, &payload).await
}

async fn read_frame<R>(reader: &mut R) -> Result<Bytes, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .io_context("Failed to read frame length")?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            length: u64::from(len),
            max: u64::from(MAX_PAYLOAD_SIZE),
        });
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .io_context("Failed to read frame payload")?;
    Ok(Bytes::from(payload))
}

async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        length: payload.len() as u64,
        max: u64::from(MAX_PAYLOAD_SIZE),
    })?;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            length: u64::from(len),
            max: u64::from(MAX_PAYLOAD_SIZE),
        });
    }
    writer
        .write_all(&len.to_le_bytes())
        .await
        .io_context("Failed to write frame length")?;
    writer
        .write_all(payload)
        .await
        .io_context("Failed to write frame payload")?;
    writer.flush().await.io_context("Failed to flush frame")?;
    Ok(())
}

fn decode_request(payload: &mut Bytes) -> Result<RunRequest, ProtocolError> {
    let version = get_u32(payload, "protocol version")?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            version,
            supported: PROTOCOL_VERSION,
        });
    }
    let language = get_string(payload, "language")?;
    let working_directory = get_string(payload, "working directory")?;
    let lib_directory = get_string(payload, "lib directory")?;
    // Each argument occupies at least 8 bytes (kind + value length), so a
    // count the remaining payload cannot possibly hold is rejected before
    // anything is allocated for it.
    let count = get_list_len(payload, "argument count", 8)?;
    let mut arguments = Vec::with_capacity(count);
    for _ in 0..count {
        let raw_kind = get_u32(payload, "argument kind")?;
        let kind = ArgumentKind::try_from(raw_kind)
            .map_err(|_| ProtocolError::UnknownArgumentKind(raw_kind))?;
        let value = get_string(payload, "argument value")?;
        arguments.push(Argument { kind, value });
    }
    Ok(RunRequest {
        language,
        working_directory,
        lib_directory,
        arguments,
    })
}

fn decode_response(payload: &mut Bytes) -> Result<BuildResponse, ProtocolError> {
    let raw_tag = get_u32(payload, "response tag")?;
    let tag =
        ResponseTag::try_from(raw_tag).map_err(|_| ProtocolError::UnknownResponseTag(raw_tag))?;
    match tag {
        ResponseTag::Completed => {
            let exit_code = get_i32(payload, "exit code")?;
            let utf8_output = get_u8(payload, "utf8 flag")? != 0;
            let output = get_string(payload, "output")?;
            let error_output = get_string(payload, "error output")?;
            Ok(BuildResponse::Completed(CompletedResponse {
                exit_code,
                utf8_output,
                output,
                error_output,
            }))
        }
        ResponseTag::AnalyzerInconsistency => {
            // A message is at least its 4-byte length prefix.
            let count = get_list_len(payload, "message count", 4)?;
            let mut messages = Vec::with_capacity(count);
            for _ in 0..count {
                messages.push(get_string(payload, "analyzer message")?);
            }
            Ok(BuildResponse::AnalyzerInconsistency { messages })
        }
        ResponseTag::Shutdown => {
            let server_pid = get_u32(payload, "server pid")?;
            Ok(BuildResponse::Shutdown { server_pid })
        }
    }
}

fn put_string(payload: &mut BytesMut, value: &str) -> Result<(), ProtocolError> {
    let len = u32::try_from(value.len()).map_err(|_| ProtocolError::FrameTooLarge {
        length: value.len() as u64,
        max: u64::from(MAX_PAYLOAD_SIZE),
    })?;
    payload.put_u32_le(len);
    payload.put_slice(value.as_bytes());
    Ok(())
}

fn list_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        length: len as u64,
        max: u64::from(MAX_PAYLOAD_SIZE),
    })
}

/// Read a list length and check it against the bytes actually left in the
/// payload, given the minimum encoded size of one element. Keeps a hostile
/// length field from driving a huge preallocation.
fn get_list_len(
    payload: &mut Bytes,
    what: &'static str,
    min_element_size: usize,
) -> Result<usize, ProtocolError> {
    let count = get_u32(payload, what)? as usize;
    if count
        .checked_mul(min_element_size)
        .is_none_or(|needed| needed > payload.remaining())
    {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(count)
}

fn get_u8(payload: &mut Bytes, what: &'static str) -> Result<u8, ProtocolError> {
    if payload.remaining() < 1 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(payload.get_u8())
}

fn get_u32(payload: &mut Bytes, what: &'static str) -> Result<u32, ProtocolError> {
    if payload.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(payload.get_u32_le())
}

fn get_i32(payload: &mut Bytes, what: &'static str) -> Result<i32, ProtocolError> {
    if payload.remaining() < 4 {
        return Err(ProtocolError::Truncated(what));
    }
    Ok(payload.get_i32_le())
}

fn get_string(payload: &mut Bytes, what: &'static str) -> Result<String, ProtocolError> {
    let len = get_u32(payload, what)? as usize;
    if payload.remaining() < len {
        return Err(ProtocolError::Truncated(what));
    }
    let bytes = payload.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|source| ProtocolError::InvalidUtf8 { what, source })
}
