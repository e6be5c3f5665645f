pub mod packet;
pub mod packet_decoder;
pub mod transport;

use async_trait::async_trait;

/// Outcome of a register read, after response classification.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadOutcome {
    Data(Vec<u16>),
    /// The device answered but produced no usable data. The connection stays up.
    NoData,
    /// The connection is gone; it has already been torn down.
    ConnectionError,
}

/// Outcome of a register write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Ok,
    /// The device rejected the write; the connection stays up.
    Failed,
    ConnectionError,
}

/// Device register I/O, injected into items per call so the transport can be
/// swapped out under test.
#[async_trait]
pub trait RegisterAccess: Send + Sync {
    async fn read_registers(&self, address: u16, count: u16, unit_id: u8) -> ReadOutcome;
    async fn write_registers(&self, address: u16, values: Vec<u16>, unit_id: u8) -> WriteOutcome;
}
