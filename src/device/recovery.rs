//! Detects boards sitting in the RP2040 bootloader.
//!
//! A board in recovery mode shows up as a mass-storage volume holding
//! `INFO_UF2.TXT` instead of a serial port. A running CircuitPython drive
//! (`boot_out.txt` present) is never reported.
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const INFO_FILE: &str = "INFO_UF2.TXT";
pub const CIRCUITPY_MARKER: &str = "boot_out.txt";
pub const DEFAULT_BOARD_ID: &str = "RPI-RP2";

/// A place where removable volumes get mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeRoot {
    /// The path itself is a volume (a Windows drive letter).
    Direct(PathBuf),
    /// Every directory up to `max_depth` levels below `base` may be a volume.
    Children { base: PathBuf, max_depth: usize },
}

impl VolumeRoot {
    /// Mount locations for the platform this was built for.
    pub fn platform_defaults() -> Vec<VolumeRoot> {
        #[cfg(target_os = "linux")]
        {
            vec![
                VolumeRoot::Children { base: PathBuf::from("/media"), max_depth: 2 },
                VolumeRoot::Children { base: PathBuf::from("/run/media"), max_depth: 2 },
            ]
        }

        #[cfg(target_os = "macos")]
        {
            vec![VolumeRoot::Children { base: PathBuf::from("/Volumes"), max_depth: 1 }]
        }

        #[cfg(target_os = "windows")]
        {
            (b'D'..=b'Z').map(|c| VolumeRoot::Direct(PathBuf::from(format!("{}:\\", c as char)))).collect()
        }

        #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
        {
            log::warn!("Recovery volume probing not supported on this platform");
            Vec::new()
        }
    }

    fn collect(&self, out: &mut Vec<PathBuf>) {
        match self {
            VolumeRoot::Direct(path) => {
                if path.is_dir() {
                    out.push(path.clone());
                }
            }
            VolumeRoot::Children { base, max_depth } => collect_dirs(base, *max_depth, out),
        }
    }
}

fn collect_dirs(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    if depth == 0 {
        return;
    }
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.push(path.clone());
            collect_dirs(&path, depth - 1, out);
        }
    }
}

/// True if `volume` looks like a bootloader drive for `board_id`.
pub fn is_recovery_volume(volume: &Path, board_id: &str) -> bool {
    if volume.join(CIRCUITPY_MARKER).exists() {
        return false;
    }
    match fs::read_to_string(volume.join(INFO_FILE)) {
        Ok(info) => info.contains(board_id),
        Err(_) => false,
    }
}

pub struct RecoveryProbe {
    roots: Vec<VolumeRoot>,
    board_id: String,
    reported: HashSet<PathBuf>,
}

impl RecoveryProbe {
    pub fn new(board_id: impl Into<String>) -> Self {
        Self::with_roots(VolumeRoot::platform_defaults(), board_id)
    }

    pub fn with_roots(roots: Vec<VolumeRoot>, board_id: impl Into<String>) -> Self {
        Self { roots, board_id: board_id.into(), reported: HashSet::new() }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// All recovery volumes currently mounted.
    pub fn find_volumes(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for root in &self.roots {
            root.collect(&mut candidates);
        }
        candidates.into_iter().filter(|v| is_recovery_volume(v, &self.board_id)).collect()
    }

    /// Volumes not reported by an earlier scan. A volume that disappears and
    /// comes back is reported again.
    pub fn scan(&mut self) -> Vec<PathBuf> {
        let present: HashSet<PathBuf> = self.find_volumes().into_iter().collect();
        self.reported.retain(|v| present.contains(v));
        let mut fresh: Vec<PathBuf> = present.difference(&self.reported).cloned().collect();
        fresh.sort();
        for v in &fresh {
            log::info!("Recovery-mode volume found at {}", v.display());
            self.reported.insert(v.clone());
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, body) in files {
            fs::write(dir.join(file), body).unwrap();
        }
        dir
    }

    #[test]
    fn finds_bootloader_and_skips_circuitpy() {
        let tmp = tempfile::tempdir().unwrap();
        let user = tmp.path().join("alice");
        let rp2 = volume(&user, "RPI-RP2", &[(INFO_FILE, "UF2 Bootloader v3.0\nModel: Raspberry Pi RP2\nBoard-ID: RPI-RP2\n")]);
        volume(&user, "CIRCUITPY", &[(INFO_FILE, "Board-ID: RPI-RP2"), (CIRCUITPY_MARKER, "Adafruit CircuitPython 9")]);
        volume(&user, "USBSTICK", &[("notes.txt", "hi")]);

        let mut probe = RecoveryProbe::with_roots(
            vec![VolumeRoot::Children { base: tmp.path().to_path_buf(), max_depth: 2 }],
            DEFAULT_BOARD_ID,
        );
        assert_eq!(probe.scan(), vec![rp2.clone()]);
        assert!(probe.scan().is_empty(), "reported once");

        fs::remove_dir_all(&rp2).unwrap();
        assert!(probe.scan().is_empty());
        volume(&user, "RPI-RP2", &[(INFO_FILE, "Board-ID: RPI-RP2")]);
        assert_eq!(probe.scan(), vec![rp2]);
    }

    #[test]
    fn other_board_ids_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let v = volume(tmp.path(), "OTHER", &[(INFO_FILE, "Board-ID: SAMD21-Feather")]);
        assert!(!is_recovery_volume(&v, DEFAULT_BOARD_ID));
        let probe = RecoveryProbe::with_roots(vec![VolumeRoot::Direct(v)], "SAMD21");
        assert_eq!(probe.find_volumes().len(), 1);
    }
}
