//! Health samples for hive heartbeats
//!
//! Every heartbeat carries the cpu and memory usage of the node at the time
//! it was written. The probe keeps one `sysinfo::System` alive between
//! samples so cpu usage is measured over the interval since the last call.

use hive_kernel::health::HealthProbe;
use hive_kernel::message::HealthSample;
use sysinfo::System;
use tracing::debug;

pub struct SysinfoProbe {
    sys: System,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        // first cpu refresh only primes the counters
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProbe for SysinfoProbe {
    fn sample(&mut self) -> HealthSample {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let sample = HealthSample {
            cpu_percent: self.sys.global_cpu_info().cpu_usage(),
            memory_mb: self.sys.used_memory() / (1024 * 1024),
        };
        debug!("[metrics] cpu {:.1}% mem {} MB", sample.cpu_percent, sample.memory_mb);
        sample
    }
}
