use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sax_bridge::config::{Battery, Config, ConfigWrapper};
use sax_bridge::sax::{ReadOutcome, RegisterAccess, WriteOutcome};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory();
impl Factory {
    pub fn battery(name: &str, master: bool, port: u16) -> Battery {
        Battery {
            enabled: true,
            name: name.to_string(),
            host: "localhost".to_string(),
            port,
            unit_id: 1,
            master,
            poll_interval_secs: Some(1),
            use_tcp_nodelay: None,
        }
    }

    pub fn config_wrapper(yaml: &str) -> ConfigWrapper {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        ConfigWrapper::from_config(config)
    }

    pub fn example_config() -> ConfigWrapper {
        Self::config_wrapper(
            r#"
            batteries:
              - name: battery_a
                host: localhost
                master: true
            "#,
        )
    }
}

/// Scripted RegisterAccess stand-in. Reads pop from a queue, writes are
/// recorded and answer from their own queue (default Ok).
#[derive(Default)]
pub struct FakeAccess {
    reads: Mutex<VecDeque<ReadOutcome>>,
    write_outcomes: Mutex<VecDeque<WriteOutcome>>,
    writes: Mutex<Vec<(u16, Vec<u16>, u8)>>,
    read_count: Mutex<u32>,
}

impl FakeAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&self, outcome: ReadOutcome) {
        self.reads.lock().unwrap().push_back(outcome);
    }

    pub fn push_write_outcome(&self, outcome: WriteOutcome) {
        self.write_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>, u8)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn read_count(&self) -> u32 {
        *self.read_count.lock().unwrap()
    }
}

#[async_trait]
impl RegisterAccess for FakeAccess {
    async fn read_registers(&self, _address: u16, _count: u16, _unit_id: u8) -> ReadOutcome {
        *self.read_count.lock().unwrap() += 1;
        self.reads
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReadOutcome::NoData)
    }

    async fn write_registers(&self, address: u16, values: Vec<u16>, unit_id: u8) -> WriteOutcome {
        self.writes.lock().unwrap().push((address, values, unit_id));
        self.write_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(WriteOutcome::Ok)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceMode {
    /// Reads answered from the register map, writes acknowledged normally.
    Normal,
    /// Writes answered with the firmware's (0xFF, 0) exception and a
    /// scrambled transaction id, like the real hardware.
    WriteQuirk,
    /// Writes accepted but never acknowledged.
    SilentWrites,
}

/// Minimal in-process Modbus TCP battery. Register map is shared with the
/// test so expectations can be seeded and writes observed.
pub struct FakeDevice {
    pub port: u16,
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    writes: Arc<Mutex<Vec<(u16, Vec<u16>)>>>,
    fail_next_read: Arc<Mutex<bool>>,
}

impl FakeDevice {
    pub async fn start(mode: DeviceMode) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let registers: Arc<Mutex<HashMap<u16, u16>>> = Arc::default();
        let writes: Arc<Mutex<Vec<(u16, Vec<u16>)>>> = Arc::default();
        let fail_next_read: Arc<Mutex<bool>> = Arc::default();

        let device = Self {
            port,
            registers: registers.clone(),
            writes: writes.clone(),
            fail_next_read: fail_next_read.clone(),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let registers = registers.clone();
                let writes = writes.clone();
                let fail_next_read = fail_next_read.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, mode, registers, writes, fail_next_read).await;
                });
            }
        });

        Ok(device)
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.registers.lock().unwrap().insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.lock().unwrap().get(&address).copied()
    }

    pub fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.writes.lock().unwrap().clone()
    }

    /// The next read request closes the connection instead of answering.
    pub fn fail_next_read(&self) {
        *self.fail_next_read.lock().unwrap() = true;
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    mode: DeviceMode,
    registers: Arc<Mutex<HashMap<u16, u16>>>,
    writes: Arc<Mutex<Vec<(u16, Vec<u16>)>>>,
    fail_next_read: Arc<Mutex<bool>>,
) -> anyhow::Result<()> {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return Ok(());
        }
        let transaction = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit = header[6];

        let mut body = vec![0u8; length.saturating_sub(1)];
        stream.read_exact(&mut body).await?;
        if body.is_empty() {
            return Ok(());
        }

        match body[0] {
            0x03 => {
                if std::mem::take(&mut *fail_next_read.lock().unwrap()) {
                    return Ok(());
                }

                let address = u16::from_be_bytes([body[1], body[2]]);
                let count = u16::from_be_bytes([body[3], body[4]]);
                let mut pdu = vec![0x03, (count * 2) as u8];
                for i in 0..count {
                    let value = registers
                        .lock()
                        .unwrap()
                        .get(&(address + i))
                        .copied()
                        .unwrap_or(0);
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
                send_frame(&mut stream, transaction, unit, &pdu).await?;
            }
            0x10 => {
                let address = u16::from_be_bytes([body[1], body[2]]);
                let count = u16::from_be_bytes([body[3], body[4]]) as usize;
                let mut values = Vec::with_capacity(count);
                for i in 0..count {
                    let offset = 6 + i * 2;
                    values.push(u16::from_be_bytes([body[offset], body[offset + 1]]));
                }

                for (i, value) in values.iter().enumerate() {
                    registers.lock().unwrap().insert(address + i as u16, *value);
                }
                writes.lock().unwrap().push((address, values));

                match mode {
                    DeviceMode::Normal => {
                        let mut pdu = vec![0x10];
                        pdu.extend_from_slice(&address.to_be_bytes());
                        pdu.extend_from_slice(&(count as u16).to_be_bytes());
                        send_frame(&mut stream, transaction, unit, &pdu).await?;
                    }
                    DeviceMode::WriteQuirk => {
                        send_frame(&mut stream, transaction.wrapping_add(17), unit, &[0xFF, 0x00])
                            .await?;
                    }
                    DeviceMode::SilentWrites => {}
                }
            }
            _ => return Ok(()),
        }
    }
}

async fn send_frame(
    stream: &mut TcpStream,
    transaction: u16,
    unit: u8,
    pdu: &[u8],
) -> anyhow::Result<()> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction.to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(&(pdu.len() as u16 + 1).to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(pdu);
    stream.write_all(&frame).await?;
    Ok(())
}
