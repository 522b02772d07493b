//! Storage/USB copy-verify test: repeatedly copy a small payload to each
//! mounted target and compare checksums, one thread per target.

use crate::cancel::CancellationToken;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const PAYLOAD_SENTENCE: &str = "Sample text for USB transfer verification. ";

/// Bytes in the payload written to every target.
pub const PAYLOAD_LEN: usize = 100;

/// The sentence repeated and cut to [`PAYLOAD_LEN`] bytes.
pub fn payload() -> Vec<u8> {
    let mut bytes = PAYLOAD_SENTENCE
        .repeat(PAYLOAD_LEN.div_ceil(PAYLOAD_SENTENCE.len()))
        .into_bytes();
    bytes.truncate(PAYLOAD_LEN);
    bytes
}

const COPY_NAME: &str = "test_copy.txt";

/// Mountpoints of partitions mounted under `/media/`, from `lsblk -o NAME,MOUNTPOINT,SIZE,TYPE`.
pub fn discover_mountpoints(lsblk_output: &str) -> Vec<PathBuf> {
    lsblk_output
        .lines()
        .filter(|line| line.contains("/media/") && line.split_whitespace().any(|f| f == "part"))
        .filter_map(|line| {
            line.split_whitespace()
                .find(|f| f.starts_with("/media/"))
                .map(PathBuf::from)
        })
        .collect()
}

/// Non-empty lines of `lsusb` output.
pub fn discover_usb(lsusb_output: &str) -> Vec<String> {
    lsusb_output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Run `lsblk` and return storage targets; errors are returned as text.
pub fn detect_storage() -> Result<Vec<PathBuf>, String> {
    let out = Command::new("lsblk")
        .args(["-o", "NAME,MOUNTPOINT,SIZE,TYPE"])
        .output()
        .map_err(|e| format!("Failed to detect storage devices: {e}"))?;
    Ok(discover_mountpoints(&String::from_utf8_lossy(&out.stdout)))
}

pub fn detect_usb() -> Result<Vec<String>, String> {
    let out = Command::new("lsusb")
        .output()
        .map_err(|e| format!("Failed to list USB devices: {e}"))?;
    Ok(discover_usb(&String::from_utf8_lossy(&out.stdout)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageProgress {
    pub index: usize,
    pub target: PathBuf,
    /// Share of the configured duration elapsed, 0..=100
    pub percent: f64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub target: PathBuf,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone)]
pub struct StorageTest {
    duration: Duration,
    pause: Duration,
}

impl Default for StorageTest {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            pause: Duration::from_secs(1),
        }
    }
}

impl StorageTest {
    pub fn new(duration: Duration, pause: Duration) -> Self {
        Self { duration, pause }
    }

    /// Copy-verify against every target until the token is set or the duration elapses.
    pub fn run<F>(&self, targets: &[PathBuf], token: &CancellationToken, progress: F) -> io::Result<Vec<TargetReport>>
    where
        F: Fn(StorageProgress) + Send + Sync + 'static,
    {
        info!("Starting storage test on {} target(s)", targets.len());
        let mut source = tempfile::NamedTempFile::new()?;
        source.write_all(&payload())?;
        source.flush()?;
        let source_path = Arc::new(source.path().to_path_buf());
        let progress = Arc::new(progress);

        let handles: Vec<_> = targets
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, target)| {
                let token = token.clone();
                let source = Arc::clone(&source_path);
                let progress = Arc::clone(&progress);
                let (duration, pause) = (self.duration, self.pause);
                thread::Builder::new()
                    .name(format!("storage-{index}"))
                    .spawn(move || test_target(index, &target, &source, duration, pause, &token, &*progress))
            })
            .collect::<io::Result<_>>()?;

        let mut reports = Vec::with_capacity(handles.len());
        for (handle, target) in handles.into_iter().zip(targets) {
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(_) => {
                    error!("Storage worker for {} panicked", target.display());
                    reports.push(TargetReport {
                        target: target.clone(),
                        successes: 0,
                        failures: 1,
                    });
                }
            }
        }
        // `source` is removed when dropped here.
        Ok(reports)
    }
}

fn checksum(path: &Path) -> io::Result<u32> {
    Ok(crc32fast::hash(&fs::read(path)?))
}

fn copy_and_verify(source: &Path, copy: &Path) -> io::Result<bool> {
    fs::copy(source, copy)?;
    let same = checksum(source)? == checksum(copy)?;
    fs::remove_file(copy)?;
    Ok(same)
}

fn test_target(
    index: usize,
    target: &Path,
    source: &Path,
    duration: Duration,
    pause: Duration,
    token: &CancellationToken,
    progress: &(dyn Fn(StorageProgress) + Send + Sync),
) -> TargetReport {
    let copy = target.join(COPY_NAME);
    let start = Instant::now();
    let (mut successes, mut failures) = (0u64, 0u64);

    while start.elapsed() < duration && !token.is_set() {
        match copy_and_verify(source, &copy) {
            Ok(true) => successes += 1,
            Ok(false) => {
                failures += 1;
                warn!("Checksum mismatch on storage device {} ({})", index + 1, target.display());
            }
            Err(e) => {
                failures += 1;
                error!("Failed to write/read to storage device {}: {}", index + 1, e);
            }
        }
        let percent = (start.elapsed().as_secs_f64() / duration.as_secs_f64() * 100.0).min(100.0);
        progress(StorageProgress {
            index,
            target: target.to_path_buf(),
            percent,
            successes,
            failures,
        });
        if token.sleep(pause) {
            break;
        }
    }

    if copy.exists() {
        let _ = fs::remove_file(&copy);
    }
    info!(
        "Storage test completed on {}: {} successes, {} failures",
        target.display(),
        successes,
        failures
    );
    TargetReport {
        target: target.to_path_buf(),
        successes,
        failures,
    }
}
