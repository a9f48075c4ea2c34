//! Blocking TCP implementation of the [`Transport`] capability.
//!
//! Framing is this crate's own business (spec explicitly leaves wire framing
//! below the target-buffer abstraction pluggable): a fixed 20-byte header —
//! `sequence_number: u64`, `target_offset: u64`, `data_length: u32`, all
//! big-endian — followed by `data_length` bytes of payload. A header with
//! `data_length == 0` is the EOF marker.

use super::{Connection, Endpoint, ReceiveStatus, TargetBuffer, Transport};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};

const HEADER_LEN: usize = 20;

pub struct TcpTransport;

impl Transport for TcpTransport {
    type Conn = TcpConnection;

    fn connect(&self, endpoint: &Endpoint) -> io::Result<TcpConnection> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::new(stream))
    }

    fn accept(&self, endpoint: &Endpoint) -> io::Result<TcpConnection> {
        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))?;
        let (stream, peer) = listener.accept()?;
        stream.set_nodelay(true)?;
        log::debug!("tcp: accepted connection from {peer}");
        Ok(TcpConnection::new(stream))
    }
}

pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> Self {
        TcpConnection { stream }
    }

    fn write_header(&mut self, buf: &TargetBuffer) -> io::Result<()> {
        let mut header = [0u8; HEADER_LEN];
        header[0..8].copy_from_slice(&buf.sequence_number.to_be_bytes());
        header[8..16].copy_from_slice(&buf.target_offset.to_be_bytes());
        header[16..20].copy_from_slice(&buf.data_length.to_be_bytes());
        self.stream.write_all(&header)
    }
}

impl Connection for TcpConnection {
    fn send_target_buffer(&mut self, buf: &TargetBuffer) -> io::Result<()> {
        self.write_header(buf)?;
        let len = buf.data_length as usize;
        self.stream.write_all(&buf.payload[..len.min(buf.payload.len())])?;
        self.stream.flush()
    }

    fn request_target_buffer(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn receive_target_buffer(&mut self) -> io::Result<(ReceiveStatus, TargetBuffer)> {
        let mut header = [0u8; HEADER_LEN];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok((ReceiveStatus::Eof, TargetBuffer::eof(0)));
            }
            Err(e) => return Err(e),
        }
        let sequence_number = u64::from_be_bytes(header[0..8].try_into().unwrap());
        let target_offset = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let data_length = u32::from_be_bytes(header[16..20].try_into().unwrap());

        if data_length == 0 {
            return Ok((
                ReceiveStatus::Eof,
                TargetBuffer {
                    sequence_number,
                    target_offset,
                    data_length,
                    payload: Vec::new(),
                },
            ));
        }

        let mut payload = vec![0u8; data_length as usize];
        if let Err(e) = self.stream.read_exact(&mut payload) {
            return if e.kind() == io::ErrorKind::UnexpectedEof {
                Ok((ReceiveStatus::Err, TargetBuffer::eof(sequence_number)))
            } else {
                Err(e)
            };
        }
        Ok((
            ReceiveStatus::Ok,
            TargetBuffer {
                sequence_number,
                target_offset,
                data_length,
                payload,
            },
        ))
    }

    fn release_target_buffer(&mut self, _buf: TargetBuffer) {}

    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(std::net::Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e),
        }
    }
}
