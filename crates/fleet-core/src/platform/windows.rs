//! Windows sampling via wmic with a PowerShell CIM fallback

use super::{
    available_cores, percent_of, run_command, with_fallback, PlatformAdapter, PlatformKind,
    RawReading,
};
use crate::error::PlatformError;
use crate::models::{CpuSample, Dimension, DiskSample, MemorySample, NetworkSample};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Sampler for Windows hosts
pub struct WindowsAdapter {
    command_timeout: Duration,
}

impl WindowsAdapter {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn powershell(&self, script: &str) -> Result<String, PlatformError> {
        run_command(
            "powershell",
            &["-NoProfile", "-NonInteractive", "-Command", script],
            self.command_timeout,
        )
        .await
    }

    /// Parse `wmic ... /value` output into records split on blank lines
    pub fn parse_wmic_values(content: &str) -> Vec<HashMap<String, String>> {
        let mut records = Vec::new();
        let mut current = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                if !current.is_empty() {
                    records.push(std::mem::take(&mut current));
                }
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                current.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        if !current.is_empty() {
            records.push(current);
        }
        records
    }

    /// Parse `Key : Value` blocks as printed by `Format-List`
    pub fn parse_format_list(content: &str) -> Vec<HashMap<String, String>> {
        let normalized: String = content
            .lines()
            .map(|line| match line.split_once(':') {
                Some((key, value)) => format!("{}={}\n", key.trim(), value.trim()),
                None => format!("{}\n", line),
            })
            .collect();
        Self::parse_wmic_values(&normalized)
    }

    /// Total received and sent bytes from `netstat -e`
    pub fn parse_netstat_e(content: &str) -> Result<NetworkSample, PlatformError> {
        let line = content
            .lines()
            .find(|l| l.trim_start().starts_with("Bytes"))
            .ok_or_else(|| PlatformError::parse("netstat -e", "missing Bytes line"))?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 2 {
            return Err(PlatformError::parse("netstat -e", "incomplete Bytes line"));
        }
        Ok(NetworkSample {
            iface: "all".to_string(),
            bytes_in: values[0],
            bytes_out: values[1],
        })
    }

    fn cpu_from_records(records: &[HashMap<String, String>]) -> Result<f64, PlatformError> {
        let loads: Vec<f64> = records
            .iter()
            .filter_map(|r| r.get("LoadPercentage"))
            .filter_map(|v| v.parse().ok())
            .collect();
        if loads.is_empty() {
            return Err(PlatformError::parse("cpu", "missing LoadPercentage"));
        }
        Ok(loads.iter().sum::<f64>() / loads.len() as f64)
    }

    /// Memory from Win32_OperatingSystem (values are in kB)
    pub fn memory_from_record(record: &HashMap<String, String>) -> Result<MemorySample, PlatformError> {
        let field = |key: &str| -> Result<u64, PlatformError> {
            record
                .get(key)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| PlatformError::parse("Win32_OperatingSystem", format!("missing {}", key)))
        };
        let total_kb = field("TotalVisibleMemorySize")?;
        let free_kb = field("FreePhysicalMemory")?;
        let used_kb = total_kb.saturating_sub(free_kb);
        Ok(MemorySample {
            total_mb: total_kb / 1024,
            used_mb: used_kb / 1024,
            free_mb: free_kb / 1024,
            percent: percent_of(used_kb, total_kb),
            buffers: 0,
            cached: 0,
        })
    }

    /// Local fixed disks (DriveType 3) from Win32_LogicalDisk records
    pub fn disks_from_records(records: &[HashMap<String, String>]) -> Vec<DiskSample> {
        records
            .iter()
            .filter(|r| r.get("DriveType").map_or(true, |t| t == "3"))
            .filter_map(|r| {
                let size: u64 = r.get("Size")?.parse().ok()?;
                let free: u64 = r.get("FreeSpace")?.parse().ok()?;
                if size == 0 {
                    return None;
                }
                let name = r.get("DeviceID").cloned().unwrap_or_default();
                let used = size.saturating_sub(free);
                Some(DiskSample {
                    total_kb: size / 1024,
                    used_kb: used / 1024,
                    free_kb: free / 1024,
                    percent: percent_of(used, size),
                    filesystem: r.get("FileSystem").cloned().unwrap_or_else(|| "NTFS".to_string()),
                    mount_point: name,
                })
            })
            .collect()
    }

    fn cores() -> u32 {
        std::env::var("NUMBER_OF_PROCESSORS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(available_cores)
    }

    async fn process_count(&self) -> u32 {
        match run_command("tasklist", &["/FO", "CSV", "/NH"], self.command_timeout).await {
            Ok(out) => out.lines().filter(|l| !l.trim().is_empty()).count() as u32,
            Err(_) => 0,
        }
    }

    async fn cpu_with(&self, output: Result<String, PlatformError>, list: bool) -> Result<CpuSample, PlatformError> {
        let out = output?;
        let records = if list {
            Self::parse_format_list(&out)
        } else {
            Self::parse_wmic_values(&out)
        };
        Ok(CpuSample {
            cores: Self::cores(),
            usage_percent: Self::cpu_from_records(&records)?.clamp(0.0, 100.0),
            // Windows has no load average
            load_average: [0.0; 3],
            process_count: self.process_count().await,
        })
    }

    async fn cpu_from_wmic(&self) -> Result<CpuSample, PlatformError> {
        let out = run_command("wmic", &["cpu", "get", "LoadPercentage", "/value"], self.command_timeout).await;
        self.cpu_with(out, false).await
    }

    async fn cpu_from_cim(&self) -> Result<CpuSample, PlatformError> {
        let out = self
            .powershell("Get-CimInstance Win32_Processor | Format-List LoadPercentage")
            .await;
        self.cpu_with(out, true).await
    }

    async fn memory_from_wmic(&self) -> Result<MemorySample, PlatformError> {
        let out = run_command(
            "wmic",
            &["OS", "get", "FreePhysicalMemory,TotalVisibleMemorySize", "/value"],
            self.command_timeout,
        )
        .await?;
        let records = Self::parse_wmic_values(&out);
        let record = records
            .first()
            .ok_or_else(|| PlatformError::parse("wmic OS", "empty output"))?;
        Self::memory_from_record(record)
    }

    async fn memory_from_cim(&self) -> Result<MemorySample, PlatformError> {
        let out = self
            .powershell(
                "Get-CimInstance Win32_OperatingSystem | Format-List FreePhysicalMemory,TotalVisibleMemorySize",
            )
            .await?;
        let records = Self::parse_format_list(&out);
        let record = records
            .first()
            .ok_or_else(|| PlatformError::parse("Win32_OperatingSystem", "empty output"))?;
        Self::memory_from_record(record)
    }

    fn non_empty_disks(records: Vec<HashMap<String, String>>) -> Result<Vec<DiskSample>, PlatformError> {
        let disks = Self::disks_from_records(&records);
        if disks.is_empty() {
            return Err(PlatformError::parse("Win32_LogicalDisk", "no fixed disks found"));
        }
        Ok(disks)
    }

    async fn disks_from_wmic(&self) -> Result<Vec<DiskSample>, PlatformError> {
        let out = run_command(
            "wmic",
            &["logicaldisk", "get", "DeviceID,DriveType,FileSystem,FreeSpace,Size", "/value"],
            self.command_timeout,
        )
        .await?;
        Self::non_empty_disks(Self::parse_wmic_values(&out))
    }

    async fn disks_from_cim(&self) -> Result<Vec<DiskSample>, PlatformError> {
        let out = self
            .powershell(
                "Get-CimInstance Win32_LogicalDisk -Filter 'DriveType=3' | Format-List DeviceID,FileSystem,FreeSpace,Size",
            )
            .await?;
        Self::non_empty_disks(Self::parse_format_list(&out))
    }

    async fn network_from_netstat(&self) -> Result<Vec<NetworkSample>, PlatformError> {
        let out = run_command("netstat", &["-e"], self.command_timeout).await?;
        Ok(vec![Self::parse_netstat_e(&out)?])
    }

    async fn network_from_cim(&self) -> Result<Vec<NetworkSample>, PlatformError> {
        let out = self
            .powershell("Get-NetAdapterStatistics | Format-List Name,ReceivedBytes,SentBytes")
            .await?;
        let samples: Vec<NetworkSample> = Self::parse_format_list(&out)
            .into_iter()
            .filter_map(|r| {
                Some(NetworkSample {
                    iface: r.get("Name")?.clone(),
                    bytes_in: r.get("ReceivedBytes")?.parse().ok()?,
                    bytes_out: r.get("SentBytes")?.parse().ok()?,
                })
            })
            .collect();
        if samples.is_empty() {
            return Err(PlatformError::parse("Get-NetAdapterStatistics", "no adapters found"));
        }
        Ok(samples)
    }
}

#[async_trait]
impl PlatformAdapter for WindowsAdapter {
    fn platform(&self) -> PlatformKind {
        PlatformKind::Windows
    }

    fn is_supported(&self) -> bool {
        cfg!(target_os = "windows")
    }

    fn preferred_polling_interval(&self) -> Duration {
        // wmic and PowerShell startup are slow
        Duration::from_secs(15)
    }

    async fn sample(&self, dimension: Dimension) -> Result<RawReading, PlatformError> {
        match dimension {
            Dimension::Cpu => with_fallback("cpu", self.cpu_from_wmic(), self.cpu_from_cim())
                .await
                .map(RawReading::Cpu),
            Dimension::Memory => {
                with_fallback("memory", self.memory_from_wmic(), self.memory_from_cim())
                    .await
                    .map(RawReading::Memory)
            }
            Dimension::Disk => with_fallback("disk", self.disks_from_wmic(), self.disks_from_cim())
                .await
                .map(RawReading::Disk),
            Dimension::Network => {
                with_fallback("network", self.network_from_netstat(), self.network_from_cim())
                    .await
                    .map(RawReading::Network)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wmic_values() {
        let out = "\r\n\r\nLoadPercentage=35\r\n\r\n\r\nLoadPercentage=45\r\n\r\n";
        let records = WindowsAdapter::parse_wmic_values(out);
        assert_eq!(records.len(), 2);
        assert_eq!(WindowsAdapter::cpu_from_records(&records).unwrap(), 40.0);
    }

    #[test]
    fn test_memory_from_record() {
        let out = "FreePhysicalMemory=4194304\r\nTotalVisibleMemorySize=16777216\r\n";
        let records = WindowsAdapter::parse_wmic_values(out);
        let memory = WindowsAdapter::memory_from_record(&records[0]).unwrap();
        assert_eq!(memory.total_mb, 16384);
        assert_eq!(memory.free_mb, 4096);
        assert_eq!(memory.percent, 75.0);
    }

    #[test]
    fn test_disks_skip_removable_drives() {
        let out = "DeviceID=C:\nDriveType=3\nFileSystem=NTFS\nFreeSpace=107374182400\nSize=214748364800\n\n\
                   DeviceID=D:\nDriveType=5\nFileSystem=\nFreeSpace=\nSize=\n";
        let disks = WindowsAdapter::disks_from_records(&WindowsAdapter::parse_wmic_values(out));
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].mount_point, "C:");
        assert_eq!(disks[0].percent, 50.0);
    }

    #[test]
    fn test_parse_format_list() {
        let out = "\nName          : Ethernet\nReceivedBytes : 1000\nSentBytes     : 500\n\n";
        let records = WindowsAdapter::parse_format_list(out);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["ReceivedBytes"], "1000");
    }

    #[test]
    fn test_parse_netstat_e() {
        let out = "Interface Statistics\n\n                           Received            Sent\n\nBytes                    2837462834       193847234\nUnicast packets             1234567          765432\n";
        let sample = WindowsAdapter::parse_netstat_e(out).unwrap();
        assert_eq!(sample.bytes_in, 2837462834);
        assert_eq!(sample.bytes_out, 193847234);
    }
}
