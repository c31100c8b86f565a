//! E350-series torque controller over Modbus TCP.

use station_core::torque::{
    DriverStatus, FieldWrite, GlobalSetpoints, SetpointUpdate, TaskParams, TighteningResult,
    TorqueController, TorqueError,
};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// Holding register map.
pub mod reg {
    /// 0 = I/O, 1 = RS485/232, 3 = CAN, 4 = ECAT.
    pub const MODE: u16 = 0xE002;
    /// 1 = torque, 0 = angle.
    pub const METHOD: u16 = 0xE130;
    /// Target torque, mN·m.
    pub const TORQUE: u16 = 0xE12C;
    pub const SPEED: u16 = 0xE15E;
    pub const AUX_DI: u16 = 0x2098;
    pub const TASK_CURRENT: u16 = 0x20C8;
    /// Five words: torque, angle, time hi, time lo, result.
    pub const LAST_RESULT: u16 = 0x20C9;
    pub const REAL_SPEED: u16 = 0x20E6;
    pub const DI: u16 = 0x20F1;
    pub const DO: u16 = 0x20F2;
    pub const FAULT: u16 = 0x20F4;
    /// Any write clears the active fault.
    pub const FAULT_RESET: u16 = 0x2005;
}

/// Offsets inside one task parameter block.
const TASK_OFFSETS: [(&str, u16); 6] = [
    ("method", 0x00),
    ("torque", 0x02),
    ("angle_lo", 0x08),
    ("angle_hi", 0x09),
    ("time_ms", 0x0A),
    ("speed", 0x32),
];

fn task_offset(field: &str) -> Option<u16> {
    TASK_OFFSETS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, off)| *off)
}

#[derive(Debug, Clone)]
pub struct TorqueDriverConfig {
    pub addr: String,
    pub unit: u8,
    /// One base per task, or a single base combined with `task_stride`.
    pub task_bases: Vec<u16>,
    pub task_stride: u16,
}

impl Default for TorqueDriverConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:502".to_string(),
            unit: 1,
            task_bases: vec![0xE120],
            task_stride: 0x20,
        }
    }
}

impl TorqueDriverConfig {
    pub fn task_base(&self, task: u16) -> Option<u16> {
        let first = *self.task_bases.first()?;
        if self.task_bases.len() > 1 {
            if let Some(base) = self.task_bases.get(task as usize) {
                return Some(*base);
            }
        }
        Some(first.wrapping_add(self.task_stride.wrapping_mul(task)))
    }
}

/// Word-level register access, so the driver logic can run against an
/// in-memory bank in tests.
pub trait RegisterBus: Send {
    fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, TorqueError>;

    fn write(&mut self, addr: u16, value: u16) -> Result<(), TorqueError>;

    /// Drops and re-opens the transport.
    fn reconnect(&mut self) -> Result<(), TorqueError>;
}

/// Modbus TCP register bus with lazy (re)connection.
pub struct ModbusRegisters {
    runtime: Runtime,
    addr: SocketAddr,
    unit: u8,
    ctx: Option<Context>,
}

impl ModbusRegisters {
    pub fn new(addr: &str, unit: u8) -> Result<Self, TorqueError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| TorqueError::Unavailable(format!("invalid address {addr}: {e}")))?;
        let runtime = Runtime::new()
            .map_err(|e| TorqueError::Unavailable(format!("failed to create runtime: {e}")))?;
        Ok(Self {
            runtime,
            addr,
            unit,
            ctx: None,
        })
    }

    fn ensure(&mut self) -> Result<(), TorqueError> {
        if self.ctx.is_none() {
            let ctx = self
                .runtime
                .block_on(tcp::connect_slave(self.addr, Slave(self.unit)))
                .map_err(|e| TorqueError::Transport(format!("connect {}: {e}", self.addr)))?;
            info!(addr = %self.addr, unit = self.unit, "Torque controller connected");
            self.ctx = Some(ctx);
        }
        Ok(())
    }
}

fn not_connected() -> TorqueError {
    TorqueError::Unavailable("no connection".to_string())
}

impl RegisterBus for ModbusRegisters {
    fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, TorqueError> {
        self.ensure()?;
        let ctx = self.ctx.as_mut().ok_or_else(not_connected)?;
        let res = self
            .runtime
            .block_on(ctx.read_holding_registers(addr, count));
        res.map_err(|e| {
            self.ctx = None;
            TorqueError::Transport(format!("read 0x{addr:04X}: {e}"))
        })
    }

    fn write(&mut self, addr: u16, value: u16) -> Result<(), TorqueError> {
        self.ensure()?;
        let ctx = self.ctx.as_mut().ok_or_else(not_connected)?;
        let res = self
            .runtime
            .block_on(ctx.write_single_register(addr, value));
        res.map_err(|e| {
            self.ctx = None;
            TorqueError::Transport(format!("write 0x{addr:04X}: {e}"))
        })
    }

    fn reconnect(&mut self) -> Result<(), TorqueError> {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = self.runtime.block_on(ctx.disconnect()) {
                debug!(error = %e, "Torque controller disconnect failed");
            }
        }
        self.ensure()
    }
}

pub struct E350Driver<B: RegisterBus> {
    bus: B,
    config: TorqueDriverConfig,
}

pub type ModbusTorqueController = E350Driver<ModbusRegisters>;

impl ModbusTorqueController {
    pub fn connect(config: TorqueDriverConfig) -> Result<Self, TorqueError> {
        let bus = ModbusRegisters::new(&config.addr, config.unit)?;
        Ok(E350Driver::with_bus(bus, config))
    }
}

impl<B: RegisterBus> E350Driver<B> {
    pub fn with_bus(bus: B, config: TorqueDriverConfig) -> Self {
        Self { bus, config }
    }

    fn read1(&mut self, addr: u16) -> Result<u16, TorqueError> {
        self.bus
            .read(addr, 1)?
            .first()
            .copied()
            .ok_or_else(|| TorqueError::Transport(format!("empty response at 0x{addr:04X}")))
    }

    fn task_base(&self, task: u16) -> Result<u16, TorqueError> {
        self.config
            .task_base(task)
            .ok_or(TorqueError::TaskBaseNotConfigured)
    }
}

impl<B: RegisterBus> TorqueController for E350Driver<B> {
    fn read_globals(&mut self) -> Result<GlobalSetpoints, TorqueError> {
        Ok(GlobalSetpoints {
            method: self.read1(reg::METHOD)?,
            torque_mnm: self.read1(reg::TORQUE)?,
            speed_rpm: self.read1(reg::SPEED)?,
        })
    }

    fn write_globals(&mut self, update: &SetpointUpdate) -> Result<(), TorqueError> {
        if let Some(method) = update.method {
            self.bus.write(reg::METHOD, method)?;
        }
        if let Some(torque) = update.torque_mnm {
            self.bus.write(reg::TORQUE, torque)?;
        }
        if let Some(speed) = update.speed_rpm {
            self.bus.write(reg::SPEED, speed)?;
        }
        Ok(())
    }

    fn read_task(&mut self, task: u16) -> Result<TaskParams, TorqueError> {
        let base = self.task_base(task)?;
        let mut word = |field: &str| -> Option<u16> {
            let addr = base.wrapping_add(task_offset(field)?);
            match self.read1(addr) {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!(task, field, addr, error = %e, "Task field unreadable");
                    None
                }
            }
        };
        let method = word("method");
        let torque_mnm = word("torque");
        let angle_lo = word("angle_lo");
        let angle_hi = word("angle_hi");
        let time_ms = word("time_ms");
        let speed_rpm = word("speed");
        Ok(TaskParams {
            method,
            torque_mnm,
            angle: angle_lo
                .zip(angle_hi)
                .map(|(lo, hi)| (u32::from(hi) << 16) | u32::from(lo)),
            time_ms,
            speed_rpm,
        })
    }

    fn write_task(&mut self, task: u16, params: &TaskParams) -> Result<Vec<FieldWrite>, TorqueError> {
        let base = self.task_base(task)?;
        let mut results = Vec::new();
        for (field, value) in params.fields() {
            let Some(offset) = task_offset(field) else {
                continue;
            };
            let addr = base.wrapping_add(offset);
            // Read first: not every firmware exposes every field.
            if let Err(e) = self.read1(addr) {
                results.push(FieldWrite {
                    field,
                    addr,
                    error: Some(format!("check_read: {e}")),
                });
                continue;
            }
            let error = self.bus.write(addr, value).err().map(|e| e.to_string());
            results.push(FieldWrite { field, addr, error });
        }
        Ok(results)
    }

    fn status(&mut self) -> Result<DriverStatus, TorqueError> {
        let mode = self.read1(reg::MODE)?;
        let fault = self.read1(reg::FAULT)?;
        let di = self.read1(reg::DI)?;
        let do_bits = self.read1(reg::DO)?;
        let speed_rpm = self.read1(reg::REAL_SPEED)?;
        let aux = self.read1(reg::AUX_DI)?;
        let task_current = self.read1(reg::TASK_CURRENT)?;
        let last = self.bus.read(reg::LAST_RESULT, 5)?;
        let &[torque_mnm, angle_decideg, time_hi, time_lo, result] = last.as_slice() else {
            return Err(TorqueError::Transport(format!(
                "last result block: expected 5 words, got {}",
                last.len()
            )));
        };
        Ok(DriverStatus {
            mode,
            fault,
            di,
            do_bits,
            speed_rpm,
            aux,
            task_current,
            last: TighteningResult {
                torque_mnm,
                angle_decideg,
                time_ms: (u32::from(time_hi) << 16) | u32::from(time_lo),
                result,
            },
        })
    }

    fn soft_restart(&mut self) -> Result<DriverStatus, TorqueError> {
        if let Err(e) = self.bus.write(reg::FAULT_RESET, 1) {
            warn!(error = %e, "Fault reset write failed");
        }
        thread::sleep(Duration::from_millis(50));
        if let Err(e) = self.bus.write(reg::MODE, 1) {
            warn!(error = %e, "Protocol mode write failed");
        }
        self.bus.reconnect()?;
        thread::sleep(Duration::from_millis(100));
        info!("Torque controller soft restart complete");
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MemoryBus {
        regs: HashMap<u16, u16>,
        missing: HashSet<u16>,
        writes: Vec<(u16, u16)>,
        reconnects: u32,
    }

    impl RegisterBus for MemoryBus {
        fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, TorqueError> {
            (addr..addr + count)
                .map(|a| {
                    if self.missing.contains(&a) {
                        Err(TorqueError::Transport(format!("illegal address 0x{a:04X}")))
                    } else {
                        Ok(self.regs.get(&a).copied().unwrap_or(0))
                    }
                })
                .collect()
        }

        fn write(&mut self, addr: u16, value: u16) -> Result<(), TorqueError> {
            self.writes.push((addr, value));
            self.regs.insert(addr, value);
            Ok(())
        }

        fn reconnect(&mut self) -> Result<(), TorqueError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    fn driver(bus: MemoryBus) -> E350Driver<MemoryBus> {
        E350Driver::with_bus(bus, TorqueDriverConfig::default())
    }

    #[test]
    fn task_base_uses_stride_or_table() {
        let cfg = TorqueDriverConfig::default();
        assert_eq!(cfg.task_base(0), Some(0xE120));
        assert_eq!(cfg.task_base(2), Some(0xE160));

        let table = TorqueDriverConfig {
            task_bases: vec![0x1000, 0x2000],
            ..TorqueDriverConfig::default()
        };
        assert_eq!(table.task_base(1), Some(0x2000));
        assert_eq!(table.task_base(3), Some(0x1000 + 3 * 0x20));

        let none = TorqueDriverConfig {
            task_bases: Vec::new(),
            ..TorqueDriverConfig::default()
        };
        assert_eq!(none.task_base(0), None);
    }

    #[test]
    fn task_write_reports_each_field() {
        let mut bus = MemoryBus::default();
        // time_ms of task 1 is not exposed by this firmware.
        bus.missing.insert(0xE140 + 0x0A);
        let mut drv = driver(bus);

        let params = TaskParams {
            torque_mnm: Some(1200),
            time_ms: Some(3000),
            speed_rpm: Some(400),
            ..TaskParams::default()
        };
        let results = drv.write_task(1, &params).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].addr, 0xE142);
        assert!(results[0].error.is_none());
        assert!(results[1].error.as_deref().unwrap().starts_with("check_read"));
        assert!(results[2].error.is_none());

        let back = drv.read_task(1).unwrap();
        assert_eq!(back.torque_mnm, Some(1200));
        assert_eq!(back.time_ms, None);
        assert_eq!(back.speed_rpm, Some(400));
    }

    #[test]
    fn task_access_without_base_fails() {
        let mut drv = E350Driver::with_bus(
            MemoryBus::default(),
            TorqueDriverConfig {
                task_bases: Vec::new(),
                ..TorqueDriverConfig::default()
            },
        );
        assert!(matches!(
            drv.read_task(0),
            Err(TorqueError::TaskBaseNotConfigured)
        ));
    }

    #[test]
    fn status_combines_result_block() {
        let mut bus = MemoryBus::default();
        bus.regs.insert(reg::MODE, 1);
        bus.regs.insert(reg::REAL_SPEED, 350);
        bus.regs.insert(reg::LAST_RESULT, 980);
        bus.regs.insert(reg::LAST_RESULT + 1, 1234);
        bus.regs.insert(reg::LAST_RESULT + 2, 0x0001);
        bus.regs.insert(reg::LAST_RESULT + 3, 0x0002);
        bus.regs.insert(reg::LAST_RESULT + 4, 2);
        let status = driver(bus).status().unwrap();
        assert_eq!(status.mode_text(), "RS485/232");
        assert_eq!(status.speed_rpm, 350);
        assert_eq!(status.last.time_ms, 0x0001_0002);
        assert_eq!(status.last.verdict(), "STRIP");
    }

    #[test]
    fn soft_restart_clears_fault_and_reconnects() {
        let mut bus = MemoryBus::default();
        bus.regs.insert(reg::MODE, 0);
        let mut drv = driver(bus);
        drv.soft_restart().unwrap();
        assert_eq!(drv.bus.writes, vec![(reg::FAULT_RESET, 1), (reg::MODE, 1)]);
        assert_eq!(drv.bus.reconnects, 1);
    }

    #[test]
    fn globals_write_only_set_fields() {
        let mut drv = driver(MemoryBus::default());
        drv.write_globals(&SetpointUpdate {
            speed_rpm: Some(500),
            ..SetpointUpdate::default()
        })
        .unwrap();
        assert_eq!(drv.bus.writes, vec![(reg::SPEED, 500)]);
        assert_eq!(drv.read_globals().unwrap().speed_rpm, 500);
    }
}
