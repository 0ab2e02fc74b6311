use std::{
    collections::HashMap,
    future,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};
use tracing::{debug, error, info, warn};

/// Current relative humidity, 0-100
pub const HUMIDITY_REGISTER: u16 = 0;
/// Leak detected, 1 or 0
pub const LEAK_REGISTER: u16 = 1;
/// Display name, two ASCII characters per register
pub const NAME_REGISTER: u16 = 100;
pub const NAME_REGISTER_COUNT: u16 = 16;

/// Device-state model the home automation hub polls: a humidity sensor carrying
/// the power percentage and a leak sensor carrying the alert.
#[derive(Clone)]
pub struct SensorAccessory {
    input_registers: Arc<Mutex<HashMap<u16, u16>>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Characteristic {
    CurrentRelativeHumidity(u8),
    LeakDetected(bool),
}

impl tokio_modbus::server::Service for SensorAccessory {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                debug!("Input register read for {addr}/{cnt}");
                register_read(&self.registers(), addr, cnt).map(Response::ReadInputRegisters)
            }
            // Some hubs only poll holding registers, serve the same map there
            Request::ReadHoldingRegisters(addr, cnt) => {
                debug!("Holding register read for {addr}/{cnt}");
                register_read(&self.registers(), addr, cnt).map(Response::ReadHoldingRegisters)
            }
            _ => {
                warn!("Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl SensorAccessory {
    /// Creates the accessory and the channel its characteristics are updated through
    pub fn new(display_name: &str) -> (Self, Sender<Characteristic>) {
        let mut input_registers = HashMap::new();
        input_registers.insert(HUMIDITY_REGISTER, 0);
        input_registers.insert(LEAK_REGISTER, 0);
        for (index, word) in encode_name(display_name).into_iter().enumerate() {
            input_registers.insert(NAME_REGISTER + index as u16, word);
        }

        let (tx, rx) = mpsc::channel(32);
        let input_registers = Arc::new(Mutex::new(input_registers));
        let handler_registers = input_registers.clone();
        tokio::spawn(async move {
            Self::handle_characteristic_updates(rx, handler_registers).await;
        });

        (Self { input_registers }, tx)
    }

    /// On-demand read of the humidity characteristic
    pub fn current_relative_humidity(&self) -> u8 {
        self.registers()
            .get(&HUMIDITY_REGISTER)
            .copied()
            .unwrap_or_default() as u8
    }

    /// On-demand read of the leak characteristic
    pub fn leak_detected(&self) -> bool {
        self.registers().get(&LEAK_REGISTER).copied().unwrap_or_default() != 0
    }

    /// Serves the accessory over Modbus TCP until the listener fails
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Serving accessory on {}", listener.local_addr()?);
        let server = Server::new(listener);
        let new_service = |_socket_addr| Ok(Some(self.clone()));
        let on_connected = |stream, socket_addr| async move {
            accept_tcp_connection(stream, socket_addr, new_service)
        };
        let on_process_error = |err| {
            error!("Accessory server error: {err}");
        };
        server.serve(&on_connected, on_process_error).await?;
        Ok(())
    }

    fn registers(&self) -> std::sync::MutexGuard<'_, HashMap<u16, u16>> {
        self.input_registers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_characteristic_updates(
        mut updates: Receiver<Characteristic>,
        input_registers: Arc<Mutex<HashMap<u16, u16>>>,
    ) {
        debug!("Starting accessory characteristic update handler");
        while let Some(update) = updates.recv().await {
            debug!("Characteristic update {update:?}");
            let (register, value) = match update {
                Characteristic::CurrentRelativeHumidity(percent) => {
                    (HUMIDITY_REGISTER, u16::from(percent))
                }
                Characteristic::LeakDetected(detected) => (LEAK_REGISTER, u16::from(detected)),
            };
            input_registers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(register, value);
        }
        debug!("Accessory characteristic update handler exiting");
    }
}

/// Packs a display name into big-endian ASCII register pairs, truncated and zero padded
fn encode_name(name: &str) -> Vec<u16> {
    let mut bytes: Vec<u8> = name
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .take(NAME_REGISTER_COUNT as usize * 2)
        .collect();
    bytes.resize(NAME_REGISTER_COUNT as usize * 2, 0);
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];
    for i in 0..cnt {
        let reg_addr = addr.wrapping_add(i);
        match registers.get(&reg_addr) {
            Some(r) => response_values[i as usize] = *r,
            None => {
                debug!("Can't handle read of register {reg_addr}/0x{reg_addr:X}");
                return Err(ExceptionCode::IllegalDataAddress);
            }
        }
    }
    Ok(response_values)
}
