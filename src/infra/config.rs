//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::SlotTable;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Tcp,
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinMode {
    Pulse,
    Protocol,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    Any,
    All,
    First,
}

impl DetectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMode::Any => "any",
            DetectionMode::All => "all",
            DetectionMode::First => "first",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    pub mode: LinkMode,
    #[serde(default = "default_actuator_host")]
    pub host: String,
    #[serde(default = "default_actuator_port")]
    pub port: u16,
    #[serde(default = "default_actuator_device")]
    pub serial_device: String,
    #[serde(default = "default_link_baud")]
    pub baud: u32,
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_command_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_pulse_ms")]
    pub pulse_ms: u64,
}

fn default_actuator_host() -> String {
    "192.168.0.60".to_string()
}

fn default_actuator_port() -> u16 {
    5000
}

fn default_actuator_device() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_link_baud() -> u32 {
    115200
}

fn default_command_timeout_ms() -> u64 {
    2000
}

fn default_command_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    150
}

fn default_pulse_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct HopperConfig {
    pub mode: LinkMode,
    #[serde(default = "default_actuator_host")]
    pub host: String,
    #[serde(default = "default_hopper_port")]
    pub port: u16,
    #[serde(default = "default_hopper_device")]
    pub serial_device: String,
    #[serde(default = "default_link_baud")]
    pub baud: u32,
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_tranche_base_ms")]
    pub tranche_base_ms: u64,
    #[serde(default = "default_per_coin_ms")]
    pub per_coin_ms: u64,
    #[serde(default = "default_command_retries")]
    pub retries: u32,
}

fn default_hopper_port() -> u16 {
    5000
}

fn default_hopper_device() -> String {
    "/dev/ttyUSB1".to_string()
}

fn default_tranche_base_ms() -> u64 {
    2000
}

fn default_per_coin_ms() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinAcceptorConfig {
    pub mode: CoinMode,
    #[serde(default = "default_coin_device")]
    pub device: String,
    #[serde(default = "default_link_baud")]
    pub baud: u32,
    /// BCM pin carrying the acceptor pulse line (pulse mode)
    #[serde(default = "default_coin_gpio_pin")]
    pub gpio_pin: u8,
    #[serde(default = "default_pulse_min_width_ms")]
    pub min_width_ms: u64,
    #[serde(default = "default_pulse_max_width_ms")]
    pub max_width_ms: u64,
    #[serde(default = "default_coin_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_balance_poll_ms")]
    pub balance_poll_ms: u64,
}

fn default_coin_device() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_coin_gpio_pin() -> u8 {
    17
}

fn default_pulse_min_width_ms() -> u64 {
    8
}

fn default_pulse_max_width_ms() -> u64 {
    120
}

fn default_coin_debounce_ms() -> u64 {
    100
}

fn default_balance_poll_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillAcceptorConfig {
    #[serde(default = "default_bill_device")]
    pub device: String,
    #[serde(default = "default_bill_baud")]
    pub baud: u32,
    #[serde(default = "default_bill_debounce_ms")]
    pub debounce_ms: u64,
    /// Ride the shared serial link instead of owning a port
    #[serde(default)]
    pub use_shared_link: bool,
    /// USB descriptor keywords accepted during the auto-detect scan
    #[serde(default = "default_detect_keywords")]
    pub detect_keywords: Vec<String>,
}

fn default_bill_device() -> String {
    "/dev/ttyUSB2".to_string()
}

fn default_bill_baud() -> u32 {
    9600
}

fn default_bill_debounce_ms() -> u64 {
    300
}

fn default_detect_keywords() -> Vec<String> {
    vec!["CH340".to_string(), "FTDI".to_string(), "CP210".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedLinkConfig {
    #[serde(default = "default_shared_device")]
    pub device: String,
    #[serde(default = "default_link_baud")]
    pub baud: u32,
}

fn default_shared_device() -> String {
    "/dev/ttyAMA0".to_string()
}

impl Default for SharedLinkConfig {
    fn default() -> Self {
        Self { device: default_shared_device(), baud: default_link_baud() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmConfig {
    #[serde(default = "default_confirm_sensors")]
    pub sensors: Vec<u8>,
    #[serde(default = "default_detection_mode")]
    pub mode: DetectionMode,
    #[serde(default = "default_confirm_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_confirm_samples")]
    pub samples: u32,
    #[serde(default = "default_confirm_sample_gap_ms")]
    pub sample_gap_ms: u64,
    /// Hardware-less testing: confirm after a fixed delay, ignoring sensors
    #[serde(default)]
    pub simulate: bool,
}

fn default_confirm_sensors() -> Vec<u8> {
    vec![1, 2]
}

fn default_detection_mode() -> DetectionMode {
    DetectionMode::Any
}

fn default_confirm_poll_ms() -> u64 {
    500
}

fn default_confirm_timeout_secs() -> u64 {
    10
}

fn default_confirm_samples() -> u32 {
    3
}

fn default_confirm_sample_gap_ms() -> u64 {
    10
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            sensors: default_confirm_sensors(),
            mode: default_detection_mode(),
            poll_interval_ms: default_confirm_poll_ms(),
            default_timeout_secs: default_confirm_timeout_secs(),
            samples: default_confirm_samples(),
            sample_gap_ms: default_confirm_sample_gap_ms(),
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MuxConfig {
    #[serde(default = "default_select_pins")]
    pub select_pins: Vec<u8>,
    #[serde(default = "default_signal_pin")]
    pub signal_pin: u8,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_select_pins() -> Vec<u8> {
    vec![5, 6, 13, 19]
}

fn default_signal_pin() -> u8 {
    26
}

fn default_settle_ms() -> u64 {
    10
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            select_pins: default_select_pins(),
            signal_pin: default_signal_pin(),
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Enable the UI-facing TCP control listener
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

fn default_control_enabled() -> bool {
    true
}

fn default_control_port() -> u16 {
    4100
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { enabled: default_control_enabled(), port: default_control_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

fn default_prometheus_port() -> u16 {
    80
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_metrics_interval(),
            prometheus_port: default_prometheus_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for session egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "sessions.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Unique kiosk identifier (e.g., "kiosk-7")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "kiosk".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub actuator: ActuatorConfig,
    pub hopper: HopperConfig,
    pub coin: CoinAcceptorConfig,
    pub bill: BillAcceptorConfig,
    #[serde(default)]
    pub shared_link: SharedLinkConfig,
    /// Slot number (as string key) to item name
    #[serde(default)]
    pub slots: HashMap<String, String>,
    #[serde(default)]
    pub confirm: ConfirmConfig,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub egress: EgressConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    actuator: ActuatorConfig,
    hopper: HopperConfig,
    coin: CoinAcceptorConfig,
    bill: BillAcceptorConfig,
    shared_link: SharedLinkConfig,
    slots: Vec<(u8, String)>,
    confirm: ConfirmConfig,
    mux: MuxConfig,
    control: ControlConfig,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    egress_file: String,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            actuator: ActuatorConfig {
                mode: LinkMode::Tcp,
                host: default_actuator_host(),
                port: default_actuator_port(),
                serial_device: default_actuator_device(),
                baud: default_link_baud(),
                timeout_ms: default_command_timeout_ms(),
                retries: default_command_retries(),
                retry_backoff_ms: default_retry_backoff_ms(),
                pulse_ms: default_pulse_ms(),
            },
            hopper: HopperConfig {
                mode: LinkMode::Tcp,
                host: default_actuator_host(),
                port: default_hopper_port(),
                serial_device: default_hopper_device(),
                baud: default_link_baud(),
                timeout_ms: default_command_timeout_ms(),
                tranche_base_ms: default_tranche_base_ms(),
                per_coin_ms: default_per_coin_ms(),
                retries: default_command_retries(),
            },
            coin: CoinAcceptorConfig {
                mode: CoinMode::Protocol,
                device: default_coin_device(),
                baud: default_link_baud(),
                gpio_pin: default_coin_gpio_pin(),
                min_width_ms: default_pulse_min_width_ms(),
                max_width_ms: default_pulse_max_width_ms(),
                debounce_ms: default_coin_debounce_ms(),
                balance_poll_ms: default_balance_poll_ms(),
            },
            bill: BillAcceptorConfig {
                device: default_bill_device(),
                baud: default_bill_baud(),
                debounce_ms: default_bill_debounce_ms(),
                use_shared_link: false,
                detect_keywords: default_detect_keywords(),
            },
            shared_link: SharedLinkConfig::default(),
            slots: Vec::new(),
            confirm: ConfirmConfig::default(),
            mux: MuxConfig::default(),
            control: ControlConfig::default(),
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: default_prometheus_port(),
            egress_file: default_egress_file(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        // Convert slot assignments from string keys to slot numbers
        let mut slots = Vec::new();
        for (key, value) in toml_config.slots {
            if let Ok(slot) = key.parse::<u8>() {
                slots.push((slot, value));
            }
        }
        slots.sort_by_key(|(slot, _)| *slot);

        Ok(Self {
            site_id: toml_config.site.id,
            actuator: toml_config.actuator,
            hopper: toml_config.hopper,
            coin: toml_config.coin,
            bill: toml_config.bill,
            shared_link: toml_config.shared_link,
            slots,
            confirm: toml_config.confirm,
            mux: toml_config.mux,
            control: toml_config.control,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            egress_file: toml_config.egress.file,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration from a path - falls back to defaults on failure
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load configuration - resolves the path from args/env first
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Build the read-only slot table from the configured assignments
    pub fn slot_table(&self) -> SlotTable {
        SlotTable::new(self.slots.clone())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn actuator(&self) -> &ActuatorConfig {
        &self.actuator
    }

    pub fn hopper(&self) -> &HopperConfig {
        &self.hopper
    }

    pub fn coin(&self) -> &CoinAcceptorConfig {
        &self.coin
    }

    pub fn bill(&self) -> &BillAcceptorConfig {
        &self.bill
    }

    pub fn shared_link(&self) -> &SharedLinkConfig {
        &self.shared_link
    }

    pub fn confirm(&self) -> &ConfirmConfig {
        &self.confirm
    }

    pub fn mux(&self) -> &MuxConfig {
        &self.mux
    }

    pub fn control(&self) -> &ControlConfig {
        &self.control
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests to set the slot assignments
    #[cfg(test)]
    pub fn with_slots(mut self, slots: Vec<(u8, String)>) -> Self {
        self.slots = slots;
        self
    }
}
