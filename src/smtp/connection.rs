use smtp_proto::Request;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{Instrument, debug, info, trace};

use crate::smtp::{
    SmtpBackend, SmtpConfig,
    session::{DataReply, SessionReply, SmtpSession},
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
    #[error("failed to write tcp stream: {0}")]
    Write(std::io::Error),
    #[error("failed to read tcp stream: {0}")]
    Read(std::io::Error),
    #[error("connection timed out")]
    Timeout,
    #[error("connection dropped unexpectedly")]
    Dropped,
}

const BUFFER_SIZE: usize = 1024;
const CODE_READY: u16 = 220;

pub async fn handle(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    server_name: &str,
    peer_addr: SocketAddr,
    backend: Arc<SmtpBackend>,
    config: &SmtpConfig,
) -> Result<(), ConnectionError> {
    let mut session = SmtpSession::new(peer_addr, backend, config.max_message_size);
    let span = tracing::info_span!(
        "smtp_session",
        correlation_id = session.correlation_id().to_string(),
        peer = peer_addr.to_string(),
    );

    run_session(stream, server_name, &mut session, config)
        .instrument(span)
        .await
}

async fn run_session(
    stream: &mut (impl AsyncReadExt + AsyncWriteExt + Unpin),
    server_name: &str,
    session: &mut SmtpSession,
    config: &SmtpConfig,
) -> Result<(), ConnectionError> {
    let (source, mut sink) = tokio::io::split(stream);

    // NOTE: we re-use this Vec<u8> to avoid re-allocating buffer
    let mut buffer = Vec::with_capacity(BUFFER_SIZE);
    let mut reader = BufReader::new(source);

    trace!("handling connection with {}", session.peer());

    write_reply(CODE_READY, server_name, &mut sink, config.write_timeout).await?;

    'session: loop {
        read_line(&mut reader, &mut buffer, config.read_timeout).await?;

        let request = Request::parse(&mut buffer.iter()).map(Request::into_owned);

        match session.handle(request).await {
            SessionReply::ReplyAndContinue(code, message) => {
                write_reply(code, &message, &mut sink, config.write_timeout).await?;
                continue;
            }
            SessionReply::ReplyAndStop(code, message) => {
                write_reply(code, &message, &mut sink, config.write_timeout).await?;
                break;
            }
            SessionReply::RawReply(buf) => {
                write_raw(&buf, &mut sink, config.write_timeout).await?;
                continue;
            }
            SessionReply::IngestData(code, message) => {
                write_reply(code, &message, &mut sink, config.write_timeout).await?;

                'data: loop {
                    read_buf(&mut reader, &mut buffer, config.read_timeout).await?;

                    match session.handle_data(&buffer).await {
                        DataReply::ContinueIngest => continue 'data,
                        DataReply::ReplyAndContinue(code, message) => {
                            write_reply(code, &message, &mut sink, config.write_timeout).await?;
                            continue 'session;
                        }
                    }
                }
            }
            SessionReply::IngestAuth(code, message) => {
                write_reply(code, &message, &mut sink, config.write_timeout).await?;
                read_buf(&mut reader, &mut buffer, config.read_timeout).await?;

                let (code, message) = session.handle_plain_auth(&mut buffer).await;
                write_reply(code, &message, &mut sink, config.write_timeout).await?;
            }
        }
    }

    info!("connection handled");

    Ok(())
}

async fn read_buf(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    timeout: Duration,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    let mut reader = reader.take(BUFFER_SIZE as u64);
    let read = reader.read_buf(buffer);

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn read_line(
    reader: impl AsyncBufReadExt + Unpin,
    buffer: &mut Vec<u8>,
    timeout: Duration,
) -> Result<usize, ConnectionError> {
    buffer.clear();

    let mut reader = reader.take(BUFFER_SIZE as u64);
    let read = reader.read_until(b'\n', buffer);

    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Read)
        .and_then(|size| {
            if size > 0 {
                Ok(size)
            } else {
                Err(ConnectionError::Dropped)
            }
        })
}

async fn write_raw(
    buf: &[u8],
    mut sink: impl AsyncWriteExt + Unpin,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    tokio::time::timeout(timeout, sink.write_all(buf))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Write)?;

    trace!("sent {} bytes", buf.len());

    Ok(())
}

pub(super) async fn write_reply(
    code: u16,
    message: &str,
    mut sink: impl AsyncWriteExt + Unpin,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let reply = format!("{code} {message}\r\n");

    tokio::time::timeout(timeout, sink.write_all(reply.as_bytes()))
        .await
        .map_err(|_| ConnectionError::Timeout)?
        .map_err(ConnectionError::Write)?;

    debug!("sent: {code} {message}");

    Ok(())
}
