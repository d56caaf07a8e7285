//! Hardware detection for local inference

use super::error::LocalAiError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use sysinfo::{CpuRefreshKind, DiskKind, Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Snapshot of the host's compute capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSpecs {
    /// Physical CPU cores
    pub cpu_cores: usize,
    /// Logical CPUs (hardware threads)
    pub cpu_threads: usize,
    /// Total system RAM in bytes
    pub total_memory_bytes: u64,
    /// RAM currently available to new processes, in bytes
    pub available_memory_bytes: u64,
    /// Whether a discrete or integrated GPU was found
    pub gpu_present: bool,
    /// GPU memory in bytes, 0 when absent or not queryable
    pub gpu_memory_bytes: u64,
    /// Whether the system disk is solid state
    pub storage_is_ssd: bool,
}

impl HardwareSpecs {
    /// Returns available RAM in gigabytes
    pub fn available_memory_gb(&self) -> f64 {
        self.available_memory_bytes as f64 / BYTES_PER_GIB
    }

    /// Returns total RAM in gigabytes
    pub fn total_memory_gb(&self) -> f64 {
        self.total_memory_bytes as f64 / BYTES_PER_GIB
    }
}

/// Source of hardware snapshots
///
/// The system implementation is [`HardwareProfiler`]; tests use [`StaticProbe`].
pub trait HardwareProbe: Send + Sync {
    /// Produce a fresh snapshot. CPU topology is stable across calls while
    /// available memory reflects current load.
    fn detect(&self) -> Result<HardwareSpecs, LocalAiError>;
}

/// Reads CPU, memory, GPU and storage details from the running system
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareProfiler;

impl HardwareProfiler {
    pub fn new() -> Self {
        Self
    }

    fn detect_gpu() -> (bool, u64) {
        if let Some(result) = Self::detect_nvidia() {
            return result;
        }

        if let Some(result) = Self::detect_platform_gpu() {
            return result;
        }

        debug!("No GPU detected");
        (false, 0)
    }

    /// Query `nvidia-smi` for total memory across devices
    fn detect_nvidia() -> Option<(bool, u64)> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
            .output()
            .ok()?;

        if !output.status.success() {
            debug!("nvidia-smi present but returned {}", output.status);
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_nvidia_memory_mib(&stdout) {
            Some(mib) => {
                info!("NVIDIA GPU detected with {} MiB memory", mib);
                Some((true, mib * 1024 * 1024))
            }
            None => {
                info!("NVIDIA GPU detected (memory info unavailable)");
                Some((true, 0))
            }
        }
    }

    /// Look for a DRM card exposing VRAM size (amdgpu, i915)
    #[cfg(target_os = "linux")]
    fn detect_platform_gpu() -> Option<(bool, u64)> {
        let entries = std::fs::read_dir("/sys/class/drm").ok()?;
        let mut found = false;
        let mut vram_bytes = 0u64;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("card") || name.contains('-') {
                continue;
            }

            let device = entry.path().join("device");
            let vendor = std::fs::read_to_string(device.join("vendor")).unwrap_or_default();
            // 0x1002 AMD, 0x8086 Intel
            if !matches!(vendor.trim(), "0x1002" | "0x8086") {
                continue;
            }

            found = true;
            if let Ok(raw) = std::fs::read_to_string(device.join("mem_info_vram_total")) {
                vram_bytes += raw.trim().parse::<u64>().unwrap_or(0);
            }
        }

        if found {
            debug!("DRM GPU detected with {} bytes VRAM", vram_bytes);
            Some((true, vram_bytes))
        } else {
            None
        }
    }

    /// Apple Silicon shares system RAM with the GPU, so there is no separate pool to report
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    fn detect_platform_gpu() -> Option<(bool, u64)> {
        debug!("Apple Silicon GPU detected (unified memory)");
        Some((true, 0))
    }

    #[cfg(not(any(
        target_os = "linux",
        all(target_os = "macos", target_arch = "aarch64")
    )))]
    fn detect_platform_gpu() -> Option<(bool, u64)> {
        None
    }

    /// Whether the disk holding the root filesystem is an SSD
    fn detect_storage_is_ssd() -> bool {
        let disks = Disks::new_with_refreshed_list();
        let root = if cfg!(windows) { Path::new("C:\\") } else { Path::new("/") };

        let root_disk = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == root)
            .or_else(|| disks.list().first());

        match root_disk.map(|disk| disk.kind()) {
            Some(DiskKind::HDD) => false,
            Some(DiskKind::SSD) => true,
            // Virtual and network block devices report Unknown; treat them as fast storage
            Some(DiskKind::Unknown(_)) | None => true,
        }
    }
}

impl HardwareProbe for HardwareProfiler {
    fn detect(&self) -> Result<HardwareSpecs, LocalAiError> {
        let sys = System::new_with_specifics(
            RefreshKind::nothing()
                .with_memory(MemoryRefreshKind::everything())
                .with_cpu(CpuRefreshKind::everything()),
        );

        let cpu_threads = sys.cpus().len();
        let total_memory_bytes = sys.total_memory();
        let available_memory_bytes = sys.available_memory();

        if cpu_threads == 0 || total_memory_bytes == 0 {
            return Err(LocalAiError::HardwareDetection {
                message: format!(
                    "unable to read CPU/memory information (cpus={}, total_memory={})",
                    cpu_threads, total_memory_bytes
                ),
            });
        }

        let cpu_cores = System::physical_core_count()
            .filter(|cores| *cores > 0)
            .unwrap_or(cpu_threads);

        let (gpu_present, gpu_memory_bytes) = Self::detect_gpu();
        let storage_is_ssd = Self::detect_storage_is_ssd();

        let specs = HardwareSpecs {
            cpu_cores,
            cpu_threads,
            total_memory_bytes,
            available_memory_bytes: available_memory_bytes.min(total_memory_bytes),
            gpu_present,
            gpu_memory_bytes,
            storage_is_ssd,
        };

        info!(
            "Hardware detected: {:.1}GB RAM available ({:.1}GB total), {} cores / {} threads, gpu: {}",
            specs.available_memory_gb(),
            specs.total_memory_gb(),
            specs.cpu_cores,
            specs.cpu_threads,
            specs.gpu_present
        );
        debug!("Hardware specs: {:?}", specs);

        Ok(specs)
    }
}

/// A probe returning a fixed snapshot whose available memory can be adjusted
#[derive(Debug)]
pub struct StaticProbe {
    specs: Mutex<HardwareSpecs>,
}

impl StaticProbe {
    pub fn new(specs: HardwareSpecs) -> Self {
        Self {
            specs: Mutex::new(specs),
        }
    }

    /// Simulate load from other processes
    pub fn set_available_memory(&self, bytes: u64) {
        let mut specs = self.specs.lock();
        specs.available_memory_bytes = bytes.min(specs.total_memory_bytes);
    }
}

impl HardwareProbe for StaticProbe {
    fn detect(&self) -> Result<HardwareSpecs, LocalAiError> {
        Ok(self.specs.lock().clone())
    }
}

/// Sum the per-device MiB values printed by `nvidia-smi`
fn parse_nvidia_memory_mib(output: &str) -> Option<u64> {
    let values: Vec<u64> = output
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum())
    }
}
