//! E2E transport abstraction — the "XNI" capability set (§4.2, §6).
//!
//! `Transport` is implemented once in-tree by [`tcp::TcpTransport`]; the rest
//! of the crate talks only to the trait, matching the Design Note that this
//! should be a pluggable interface rather than the original's mixed feature
//! flags.

pub mod tcp;

use std::io;
use std::sync::Mutex;

/// A network endpoint: host plus port.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// One E2E address-table entry: `port_count` consecutive ports on `hostname`
/// starting at `base_port` (§3 "E2E Address Table").
#[derive(Debug, Clone)]
pub struct AddressTableEntry {
    pub hostname: String,
    pub base_port: u16,
    pub port_count: u16,
}

/// Ordered address-table entries. The sum of `port_count` across entries is
/// the number of connections the target opens; worker `w`'s global index
/// falls into exactly one entry's port span.
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    entries: Vec<AddressTableEntry>,
}

impl AddressTable {
    pub fn new(entries: Vec<AddressTableEntry>) -> Self {
        AddressTable { entries }
    }

    pub fn total_connections(&self) -> usize {
        self.entries.iter().map(|e| e.port_count as usize).sum()
    }

    pub fn endpoint_for_connection(&self, connection_index: usize) -> Option<Endpoint> {
        let mut remaining = connection_index;
        for entry in &self.entries {
            let span = entry.port_count as usize;
            if remaining < span {
                return Some(Endpoint {
                    host: entry.hostname.clone(),
                    port: entry.base_port + remaining as u16,
                });
            }
            remaining -= span;
        }
        None
    }
}

/// Status returned by [`Connection::receive_target_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Ok,
    Eof,
    Err,
}

/// A transport-owned buffer carrying `{sequence_number, target_offset,
/// data_length}` plus payload (§3 "Target Buffer"). The inverse of one
/// submitted via `send_target_buffer` is what `receive_target_buffer`
/// returns on the other end.
#[derive(Debug, Clone)]
pub struct TargetBuffer {
    pub sequence_number: u64,
    pub target_offset: u64,
    pub data_length: u32,
    pub payload: Vec<u8>,
}

impl TargetBuffer {
    pub fn eof(sequence_number: u64) -> Self {
        TargetBuffer {
            sequence_number,
            target_offset: 0,
            data_length: 0,
            payload: Vec::new(),
        }
    }

    /// A zero-length buffer is the EOF marker (§4.2 "EOF").
    pub fn is_eof_marker(&self) -> bool {
        self.data_length == 0
    }
}

/// One established connection's capability set (§4.2).
pub trait Connection: Send {
    fn send_target_buffer(&mut self, buf: &TargetBuffer) -> io::Result<()>;
    /// Ask the transport for a fresh buffer to receive the next disk read
    /// into. The in-tree TCP transport has no separate buffer pool of its
    /// own (it reuses the target's `BufferPool`), so this is a no-op hook
    /// kept for transports that do manage their own buffers.
    fn request_target_buffer(&mut self) -> io::Result<()>;
    fn receive_target_buffer(&mut self) -> io::Result<(ReceiveStatus, TargetBuffer)>;
    fn release_target_buffer(&mut self, buf: TargetBuffer);
    fn close(&mut self) -> io::Result<()>;
}

/// The pluggable network transport capability (§4.2, §6).
pub trait Transport: Send + Sync {
    type Conn: Connection;

    fn connect(&self, endpoint: &Endpoint) -> io::Result<Self::Conn>;
    fn accept(&self, endpoint: &Endpoint) -> io::Result<Self::Conn>;
}

/// Per-target E2E state (§3 "E2E State"): the address table plus one
/// mutex-guarded connection slot per table entry's port span.
///
/// The first-use race (§4.2) is resolved by holding the slot's mutex across
/// the lazy `connect`/`accept`: whichever worker gets there first pays for
/// establishment, every later caller just finds `Some(conn)` already there.
pub struct E2eState<T: Transport> {
    address_table: AddressTable,
    connections: Vec<Mutex<Option<T::Conn>>>,
}

impl<T: Transport> E2eState<T> {
    pub fn new(address_table: AddressTable) -> Self {
        let n = address_table.total_connections();
        let connections = (0..n).map(|_| Mutex::new(None)).collect();
        E2eState {
            address_table,
            connections,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn address_table(&self) -> &AddressTable {
        &self.address_table
    }

    /// Run `f` against the connection bound to `connection_index`,
    /// establishing it first if no worker has yet.
    pub fn with_connection<R>(
        &self,
        transport: &T,
        connection_index: usize,
        as_destination: bool,
        f: impl FnOnce(&mut T::Conn) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut slot = self.connections[connection_index]
            .lock()
            .expect("connection mutex poisoned");
        if slot.is_none() {
            let endpoint = self
                .address_table
                .endpoint_for_connection(connection_index)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no address-table entry for connection")
                })?;
            let conn = if as_destination {
                transport.accept(&endpoint)?
            } else {
                transport.connect(&endpoint)?
            };
            log::debug!("e2e: connection {connection_index} established");
            *slot = Some(conn);
        }
        f(slot.as_mut().expect("just established"))
    }

    /// Disconnect and drop every connection. Closing happens while each
    /// slot's mutex is held, and the whole `Vec` (mutexes included) is
    /// dropped immediately after — there is no window where the count and
    /// the mutex array can disagree, unlike the original's free-after-zero
    /// ordering bug (§9 Open Question).
    pub fn close_all(&self) {
        for slot in &self.connections {
            let mut guard = slot.lock().expect("connection mutex poisoned");
            if let Some(mut conn) = guard.take() {
                if let Err(e) = conn.close() {
                    log::warn!("e2e: close failed: {e}");
                }
            }
        }
    }
}
