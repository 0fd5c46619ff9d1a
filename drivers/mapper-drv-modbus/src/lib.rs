//! A simulated modbus-tcp driver.
//!
//! The driver keeps a register bank in memory instead of opening a
//! TCP connection, which makes it usable on nodes without attached
//! hardware and in tests. The addressing contract is the real one: a
//! visitor's `offset` selects the register, and values travel as
//! ASCII byte strings the way the wire layer delivers them.
//!
//! # Configuration
//!
//! Three parameters are read from the protocol `configData`:
//!
//! - `addr` is the host name or IP address of the device. Falls back
//!   to `MAPPER_MODBUS_ADDR`, then `127.0.0.1`.
//! - `port` is the TCP port. Falls back to `MAPPER_MODBUS_PORT`,
//!   then 1502.
//! - `unitId` is the modbus unit identifier (default 1).

use async_trait::async_trait;
use mapper_api::{
    driver::{DeviceClient, ProtocolConfig, Visitor},
    types::device,
    Error, Result,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod config;

pub use config::Params;

#[derive(Clone, Copy, Debug, PartialEq)]
enum RunState {
    Created,
    Running,
    Stopped,
}

struct Bank {
    run_state: RunState,
    registers: HashMap<i64, String>,
}

/// Driver client for one simulated modbus device. All operations
/// serialize behind the client's own lock, as the driver contract
/// requires.
pub struct ModbusClient {
    params: Params,
    bank: Mutex<Bank>,
}

impl ModbusClient {
    pub fn new(protocol: &ProtocolConfig) -> ModbusClient {
        let params = Params::from_config(&protocol.config_data);

        ModbusClient {
            params,
            bank: Mutex::new(Bank {
                run_state: RunState::Created,
                registers: HashMap::new(),
            }),
        }
    }

    // Registers without a resolved offset land on register 0.

    fn register_of(visitor: &Visitor) -> i64 {
        visitor.offset.unwrap_or(0)
    }
}

#[async_trait]
impl DeviceClient for ModbusClient {
    async fn init(&self) -> Result<()> {
        let mut bank = self.bank.lock().await;

        info!(
            "modbus client ready -- addr: {}:{}, unit: {}",
            &self.params.addr, self.params.port, self.params.unit_id
        );
        bank.run_state = RunState::Running;
        Ok(())
    }

    async fn read(&self, visitor: &Visitor) -> Result<Vec<u8>> {
        let bank = self.bank.lock().await;

        if bank.run_state != RunState::Running {
            return Err(Error::OperationError(String::from(
                "client is not running",
            )));
        }

        let reg = ModbusClient::register_of(visitor);
        let value = bank
            .registers
            .get(&reg)
            .cloned()
            .unwrap_or_else(|| String::from("0"));

        debug!(
            "read -- prop: {}, reg: {}, value: {}",
            &visitor.property_name, reg, &value
        );
        Ok(value.into_bytes())
    }

    async fn write(&self, value: &str, visitor: &Visitor) -> Result<()> {
        let mut bank = self.bank.lock().await;

        if bank.run_state != RunState::Running {
            return Err(Error::OperationError(String::from(
                "client is not running",
            )));
        }

        let reg = ModbusClient::register_of(visitor);

        debug!(
            "write -- prop: {}, reg: {}, value: {}",
            &visitor.property_name, reg, value
        );
        bank.registers.insert(reg, value.to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut bank = self.bank.lock().await;

        bank.run_state = RunState::Stopped;
        Ok(())
    }

    async fn state(&self) -> Result<String> {
        let bank = self.bank.lock().await;

        Ok(match bank.run_state {
            RunState::Created => device::STATUS_UNKNOWN.to_string(),
            RunState::Running => device::STATUS_OK.to_string(),
            RunState::Stopped => device::STATUS_OFFLINE.to_string(),
        })
    }
}
