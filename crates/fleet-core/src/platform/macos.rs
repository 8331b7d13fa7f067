//! macOS sampling via sysctl, vm_stat, top and netstat

use super::{
    available_cores, parse_df, percent_of, run_command, usage_from_load, with_fallback,
    PlatformAdapter, PlatformKind, RawReading,
};
use crate::error::PlatformError;
use crate::models::{CpuSample, Dimension, DiskSample, MemorySample, NetworkSample};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Sampler for macOS hosts
pub struct MacOsAdapter {
    command_timeout: Duration,
}

impl MacOsAdapter {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn sysctl(&self, key: &str) -> Result<String, PlatformError> {
        run_command("sysctl", &["-n", key], self.command_timeout)
            .await
            .map(|out| out.trim().to_string())
    }

    /// Parse `sysctl -n vm.loadavg`, e.g. `{ 1.50 1.20 0.90 }`
    pub fn parse_loadavg(content: &str) -> Result<[f64; 3], PlatformError> {
        let values: Vec<f64> = content
            .trim()
            .trim_start_matches('{')
            .trim_end_matches('}')
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 3 {
            return Err(PlatformError::parse("vm.loadavg", "expected three averages"));
        }
        Ok([values[0], values[1], values[2]])
    }

    /// Busy percent from the `CPU usage:` line of `top -l 1 -n 0`
    pub fn parse_top_cpu(content: &str) -> Result<f64, PlatformError> {
        let line = content
            .lines()
            .find(|l| l.trim_start().starts_with("CPU usage:"))
            .ok_or_else(|| PlatformError::parse("top", "missing CPU usage line"))?;

        // CPU usage: 7.50% user, 5.0% sys, 87.50% idle
        let idle = line
            .split(',')
            .find(|part| part.contains("idle"))
            .and_then(|part| part.split_whitespace().next())
            .and_then(|v| v.trim_end_matches('%').parse::<f64>().ok())
            .ok_or_else(|| PlatformError::parse("top", "missing idle percentage"))?;

        Ok((100.0 - idle).clamp(0.0, 100.0))
    }

    /// Parse `vm_stat` into page size and page counts by label
    pub fn parse_vm_stat(content: &str) -> Result<(u64, HashMap<String, u64>), PlatformError> {
        let mut lines = content.lines();
        let header = lines
            .next()
            .ok_or_else(|| PlatformError::parse("vm_stat", "empty output"))?;
        // Mach Virtual Memory Statistics: (page size of 16384 bytes)
        let page_size = header
            .split("page size of")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096);

        let pages = lines
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let value = value.trim().trim_end_matches('.').parse().ok()?;
                Some((key.trim().to_string(), value))
            })
            .collect();

        Ok((page_size, pages))
    }

    /// Build a memory sample from vm_stat pages and `hw.memsize` bytes
    pub fn memory_from_vm_stat(
        page_size: u64,
        pages: &HashMap<String, u64>,
        total_bytes: u64,
    ) -> MemorySample {
        let page = |key: &str| pages.get(key).copied().unwrap_or(0) * page_size;
        let free = page("Pages free") + page("Pages inactive") + page("Pages speculative");
        let cached = page("File-backed pages");
        let used = total_bytes.saturating_sub(free);

        MemorySample {
            total_mb: total_bytes / (1024 * 1024),
            used_mb: used / (1024 * 1024),
            free_mb: free / (1024 * 1024),
            percent: percent_of(used, total_bytes),
            buffers: 0,
            cached: cached / (1024 * 1024),
        }
    }

    /// Parse the `PhysMem:` line of `top -l 1 -n 0`
    pub fn parse_top_physmem(content: &str) -> Result<MemorySample, PlatformError> {
        let line = content
            .lines()
            .find(|l| l.trim_start().starts_with("PhysMem:"))
            .ok_or_else(|| PlatformError::parse("top", "missing PhysMem line"))?;

        // PhysMem: 15G used (2048M wired), 1024M unused.
        let mut used = None;
        let mut unused = None;
        for part in line.trim_start_matches("PhysMem:").split(',') {
            let mut words = part.split_whitespace();
            let amount = words.next().and_then(parse_size_mb);
            match (amount, words.next()) {
                (Some(mb), Some("used")) => used = Some(mb),
                (Some(mb), Some(w)) if w.starts_with("unused") => unused = Some(mb),
                _ => {}
            }
        }

        let used = used.ok_or_else(|| PlatformError::parse("top", "missing used memory"))?;
        let free = unused.unwrap_or(0);
        let total = used + free;
        Ok(MemorySample {
            total_mb: total,
            used_mb: used,
            free_mb: free,
            percent: percent_of(used, total),
            buffers: 0,
            cached: 0,
        })
    }

    /// Parse `netstat -ib`, keeping one row per interface and skipping loopback
    pub fn parse_netstat(content: &str) -> Vec<NetworkSample> {
        let mut seen = HashMap::new();
        for line in content.lines().skip(1) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 7 || parts[0].starts_with("lo") {
                continue;
            }
            // Address column may be blank, so read from the right:
            // ... Ibytes Opkts Oerrs Obytes Coll
            let n = parts.len();
            let (Ok(bytes_in), Ok(bytes_out)) =
                (parts[n - 5].parse::<u64>(), parts[n - 2].parse::<u64>())
            else {
                continue;
            };
            seen.entry(parts[0].to_string())
                .or_insert(NetworkSample {
                    iface: parts[0].to_string(),
                    bytes_in,
                    bytes_out,
                });
        }
        let mut samples: Vec<NetworkSample> = seen.into_values().collect();
        samples.sort_by(|a, b| a.iface.cmp(&b.iface));
        samples
    }

    async fn cores(&self) -> u32 {
        match self.sysctl("hw.ncpu").await {
            Ok(out) => out.parse().unwrap_or_else(|_| available_cores()),
            Err(_) => available_cores(),
        }
    }

    async fn process_count(&self) -> u32 {
        match run_command("ps", &["-A", "-o", "pid="], self.command_timeout).await {
            Ok(out) => out.lines().filter(|l| !l.trim().is_empty()).count() as u32,
            Err(_) => 0,
        }
    }

    async fn cpu_from_top(&self) -> Result<CpuSample, PlatformError> {
        let top = run_command("top", &["-l", "1", "-n", "0"], self.command_timeout).await?;
        let usage_percent = Self::parse_top_cpu(&top)?;
        let load_average = Self::parse_loadavg(&self.sysctl("vm.loadavg").await?)?;
        Ok(CpuSample {
            cores: self.cores().await,
            usage_percent,
            load_average,
            process_count: self.process_count().await,
        })
    }

    async fn cpu_from_load(&self) -> Result<CpuSample, PlatformError> {
        let load_average = Self::parse_loadavg(&self.sysctl("vm.loadavg").await?)?;
        let cores = self.cores().await;
        Ok(CpuSample {
            cores,
            usage_percent: usage_from_load(load_average[0], cores),
            load_average,
            process_count: self.process_count().await,
        })
    }

    async fn memory_from_vm(&self) -> Result<MemorySample, PlatformError> {
        let total_bytes: u64 = self
            .sysctl("hw.memsize")
            .await?
            .parse()
            .map_err(|e| PlatformError::parse("hw.memsize", format!("{}", e)))?;
        let out = run_command("vm_stat", &[], self.command_timeout).await?;
        let (page_size, pages) = Self::parse_vm_stat(&out)?;
        Ok(Self::memory_from_vm_stat(page_size, &pages, total_bytes))
    }

    async fn memory_from_top(&self) -> Result<MemorySample, PlatformError> {
        let out = run_command("top", &["-l", "1", "-n", "0"], self.command_timeout).await?;
        Self::parse_top_physmem(&out)
    }

    async fn disks(&self, args: &[&str]) -> Result<Vec<DiskSample>, PlatformError> {
        let out = run_command("df", args, self.command_timeout).await?;
        parse_df(&out)
    }

    async fn network_from_netstat(&self, args: &[&str]) -> Result<Vec<NetworkSample>, PlatformError> {
        let out = run_command("netstat", args, self.command_timeout).await?;
        let samples = Self::parse_netstat(&out);
        if samples.is_empty() {
            return Err(PlatformError::parse("netstat", "no interfaces found"));
        }
        Ok(samples)
    }
}

/// Parse sizes like `15G`, `2048M`, `512K` into megabytes
fn parse_size_mb(value: &str) -> Option<u64> {
    let value = value.trim_end_matches('.');
    let (number, unit) = value.split_at(value.len().checked_sub(1)?);
    let number: f64 = number.parse().ok()?;
    let mb = match unit {
        "G" => number * 1024.0,
        "M" => number,
        "K" => number / 1024.0,
        "T" => number * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(mb as u64)
}

#[async_trait]
impl PlatformAdapter for MacOsAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::MacOs
    }

    fn is_supported(&self) -> bool {
        cfg!(target_os = "macos")
    }

    fn preferred_polling_interval(&self) -> Duration {
        // `top -l 1` takes about a second on its own
        Duration::from_secs(10)
    }

    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError> {
        match dimension {
            Dimension::Cpu => with_fallback("cpu", self.cpu_from_top(), self.cpu_from_load())
                .await
                .map(RawReading::Cpu),
            Dimension::Memory => {
                with_fallback("memory", self.memory_from_vm(), self.memory_from_top())
                    .await
                    .map(RawReading::Memory)
            }
            Dimension::Disk => {
                with_fallback("disk", self.disks(&["-kP"]), self.disks(&["-k"]))
                    .await
                    .map(RawReading::Disk)
            }
            Dimension::Network => with_fallback(
                "network",
                self.network_from_netstat(&["-ib"]),
                self.network_from_netstat(&["-ibn"]),
            )
            .await
            .map(RawReading::Network),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VM_STAT: &str = "Mach Virtual Memory Statistics: (page size of 16384 bytes)
Pages free:                               65536.
Pages active:                            262144.
Pages inactive:                           65536.
Pages speculative:                            0.
File-backed pages:                       131072.
";

    #[test]
    fn test_parse_loadavg() {
        let load = MacOsAdapter::parse_loadavg("{ 2.10 1.75 1.50 }\n").unwrap();
        assert_eq!(load, [2.10, 1.75, 1.50]);
        assert!(MacOsAdapter::parse_loadavg("{ }").is_err());
    }

    #[test]
    fn test_parse_top_cpu() {
        let top = "Processes: 512 total, 3 running\nCPU usage: 7.50% user, 5.0% sys, 87.50% idle \n";
        assert_eq!(MacOsAdapter::parse_top_cpu(top).unwrap(), 12.5);
        assert!(MacOsAdapter::parse_top_cpu("nothing here").is_err());
    }

    #[test]
    fn test_memory_from_vm_stat() {
        let (page_size, pages) = MacOsAdapter::parse_vm_stat(VM_STAT).unwrap();
        assert_eq!(page_size, 16384);
        assert_eq!(pages["Pages active"], 262144);

        // 8 GiB total, 2 GiB free+inactive
        let memory = MacOsAdapter::memory_from_vm_stat(page_size, &pages, 8 * 1024 * 1024 * 1024);
        assert_eq!(memory.total_mb, 8192);
        assert_eq!(memory.free_mb, 2048);
        assert_eq!(memory.used_mb, 6144);
        assert_eq!(memory.percent, 75.0);
        assert_eq!(memory.cached, 2048);
    }

    #[test]
    fn test_parse_top_physmem() {
        let top = "PhysMem: 15G used (2048M wired), 1024M unused.\n";
        let memory = MacOsAdapter::parse_top_physmem(top).unwrap();
        assert_eq!(memory.used_mb, 15360);
        assert_eq!(memory.free_mb, 1024);
        assert_eq!(memory.total_mb, 16384);
    }

    #[test]
    fn test_parse_netstat_skips_loopback_and_duplicates() {
        let out = "Name       Mtu   Network       Address            Ipkts Ierrs     Ibytes    Opkts Oerrs     Obytes  Coll
lo0        16384 <Link#1>                        1000     0     500000     1000     0     500000     0
en0        1500  <Link#6>    aa:bb:cc:dd:ee:ff   2000     0    3000000     1500     0    1000000     0
en0        1500  192.168.1     192.168.1.20      2000     -    3000000     1500     -    1000000     -
";
        let samples = MacOsAdapter::parse_netstat(out);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].iface, "en0");
        assert_eq!(samples[0].bytes_in, 3000000);
        assert_eq!(samples[0].bytes_out, 1000000);
    }

    #[test]
    fn test_parse_size_mb() {
        assert_eq!(parse_size_mb("2G"), Some(2048));
        assert_eq!(parse_size_mb("512M"), Some(512));
        assert_eq!(parse_size_mb("1024K"), Some(1));
        assert_eq!(parse_size_mb("12X"), None);
    }
}
