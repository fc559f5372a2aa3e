use argus_common::schema::{RegistryError, SchemaRegistry};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::FakerError;

/// CPU counts a fake host may report.
pub const CPU_COUNTS: [usize; 10] = [2, 4, 6, 8, 12, 16, 24, 32, 48, 64];

/// Load per CPU, in percent.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(transparent)]
pub struct CpuLoad(pub Vec<f64>);

/// Cumulative time spent per CPU state.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CpuTimes {
    pub user: f64,
    pub nice: f64,
    pub system: f64,
    pub idle: f64,
    pub iowait: f64,
    pub irq: f64,
    pub softirq: f64,
    pub steal: f64,
    pub guest: f64,
    pub guest_nice: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Cpus {
    pub load: CpuLoad,
    pub times: CpuTimes,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub cpus: Cpus,
}

/// Produces random heartbeats for a host with a fixed number of CPUs.
pub struct HeartbeatGenerator<R> {
    rng: R,
    cpu_count: usize,
    registry: SchemaRegistry,
}

impl<R: Rng> HeartbeatGenerator<R> {
    /// The CPU count is picked once, here, and kept for every record.
    pub fn new(mut rng: R, registry: SchemaRegistry) -> Self {
        let cpu_count = CPU_COUNTS.choose(&mut rng).copied().unwrap_or(CPU_COUNTS[0]);

        Self {
            rng,
            cpu_count,
            registry,
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn cpu_load(&mut self) -> CpuLoad {
        CpuLoad(
            (0..self.cpu_count)
                .map(|_| f64::from(self.rng.gen_range(0..=1000_u32)) / 10.0)
                .collect(),
        )
    }

    pub fn cpu_times(&mut self) -> CpuTimes {
        let mut time = || f64::from(self.rng.gen_range(0..100_000_u32)) / 100.0;

        CpuTimes {
            user: time(),
            nice: time(),
            system: time(),
            idle: time(),
            iowait: time(),
            irq: time(),
            softirq: time(),
            steal: time(),
            guest: time(),
            guest_nice: time(),
        }
    }

    pub fn cpus(&mut self) -> Cpus {
        Cpus {
            load: self.cpu_load(),
            times: self.cpu_times(),
        }
    }

    pub fn heartbeat(&mut self) -> Heartbeat {
        Heartbeat {
            timestamp: Utc::now(),
            cpus: self.cpus(),
        }
    }

    /// Generate one record for `schema_key` in its wire form.
    pub fn generate(&mut self, schema_key: &str) -> Result<Value, FakerError> {
        match schema_key {
            "cpu_load" => {
                let load = self.cpu_load();
                self.encode_load(&load)
            }
            "cpu_times" => {
                let times = self.cpu_times();
                self.encode_times(&times)
            }
            "cpus" => {
                let cpus = self.cpus();
                self.encode_cpus(&cpus)
            }
            "heartbeat" => {
                let heartbeat = self.heartbeat();
                self.encode_heartbeat(&heartbeat)
            }
            unknown => Err(RegistryError::NotFound(unknown.to_owned()).into()),
        }
    }

    pub fn encode_load(&self, load: &CpuLoad) -> Result<Value, FakerError> {
        self.encode("cpu_load", serde_json::to_value(load)?)
    }

    pub fn encode_times(&self, times: &CpuTimes) -> Result<Value, FakerError> {
        self.encode("cpu_times", serde_json::to_value(times)?)
    }

    /// Each part is encoded under its own schema before the whole is.
    pub fn encode_cpus(&self, cpus: &Cpus) -> Result<Value, FakerError> {
        let load = self.encode_load(&cpus.load)?;
        let times = self.encode_times(&cpus.times)?;

        self.encode("cpus", json!({"load": load, "times": times}))
    }

    pub fn encode_heartbeat(&self, heartbeat: &Heartbeat) -> Result<Value, FakerError> {
        let cpus = self.encode_cpus(&heartbeat.cpus)?;

        self.encode(
            "heartbeat",
            json!({"timestamp": heartbeat.timestamp, "cpus": cpus}),
        )
    }

    fn encode(&self, schema_key: &str, value: Value) -> Result<Value, FakerError> {
        Ok(self.registry.encode(schema_key, &value)?)
    }
}
