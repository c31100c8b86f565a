use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub config_path: Option<PathBuf>,
    pub sim: bool,
    /// Simulator only: tap the start pedal at this period.
    pub sim_pedal_ms: Option<u64>,
    pub modbus_io: Option<String>,
    pub modbus_io_unit: u8,
    pub torque_addr: Option<String>,
    pub torque_unit: u8,
    pub bind_addr: String,
    pub bridge_enabled: bool,
    pub autostart: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            config_path: None,
            sim: false,
            sim_pedal_ms: None,
            modbus_io: None,
            modbus_io_unit: 1,
            torque_addr: None,
            torque_unit: 1,
            bind_addr: "127.0.0.1:7100".to_string(),
            bridge_enabled: true,
            autostart: false,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    if i + 1 < args.len() {
                        cfg.config_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--sim" => {
                    cfg.sim = true;
                }
                "--sim-pedal-ms" => {
                    if i + 1 < args.len() {
                        cfg.sim_pedal_ms = args[i + 1].parse::<u64>().ok().filter(|ms| *ms > 0);
                        i += 1;
                    }
                }
                "--modbus-io" => {
                    if i + 1 < args.len() {
                        cfg.modbus_io = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--io-unit" => {
                    if i + 1 < args.len() {
                        cfg.modbus_io_unit = args[i + 1].parse().unwrap_or(1);
                        i += 1;
                    }
                }
                "--torque" => {
                    if i + 1 < args.len() {
                        cfg.torque_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--torque-unit" => {
                    if i + 1 < args.len() {
                        cfg.torque_unit = args[i + 1].parse().unwrap_or(1);
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        cfg.bind_addr = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--no-bridge" => {
                    cfg.bridge_enabled = false;
                }
                "--autostart" => {
                    cfg.autostart = true;
                }
                "--run-seconds" => {
                    if i + 1 < args.len() {
                        cfg.run_seconds = args[i + 1].parse::<u64>().ok();
                        i += 1;
                    }
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    if i + 1 < args.len() {
                        cfg.log_dir = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--metrics-addr" => {
                    if i + 1 < args.len() {
                        cfg.metrics_addr = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--audit-log" => {
                    if i + 1 < args.len() {
                        cfg.audit_path = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        cfg
    }

    /// Simulated pins unless a Modbus I/O module was named.
    pub fn simulated_io(&self) -> bool {
        self.sim || self.modbus_io.is_none()
    }

    pub fn print_help() {
        println!(
            r#"screw-station - Screw-fastening station controller

USAGE:
    screw-station [OPTIONS]

OPTIONS:
    --config <PATH>         Station layout JSON (relays, sensors, interlocks, cycle)
    --sim                   Run against the simulated fixture and torque controller
    --sim-pedal-ms <MS>     Simulator only: press the start pedal every MS milliseconds
    --modbus-io <ADDR>      Relay/sensor module over Modbus TCP (e.g. 192.168.1.20:502)
    --io-unit <N>           Modbus unit id of the I/O module [default: 1]
    --torque <ADDR>         Torque controller over Modbus TCP (e.g. 192.168.1.30:502)
    --torque-unit <N>       Modbus unit id of the torque controller [default: 1]
    --bind <ADDR>           Command bridge bind address [default: 127.0.0.1:7100]
    --no-bridge             Disable the command bridge
    --autostart             Start the fastening cycle immediately
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format (for log aggregation)
    --log-dir <PATH>        Also write daily-rolling log files to this directory
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>      Enable audit logging to specified JSONL file
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,station_core=trace)

EXAMPLES:
    # Bench run against the simulator
    screw-station --sim --sim-pedal-ms 1500 --autostart --metrics-addr 0.0.0.0:9090

    # Line deployment
    screw-station --config /etc/station/layout.json --modbus-io 192.168.1.20:502 \
        --torque 192.168.1.30:502 --json-logs --audit-log /var/log/station/audit.jsonl

    # Short smoke run
    screw-station --sim --autostart --run-seconds 10 --no-bridge
"#
        );
    }
}
