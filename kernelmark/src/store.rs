// Copyright (c) The kernelmark Authors.
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kernelmark_intf::{ResultName, RunSpec};
use km_util::*;

const MARKER_DOC: &str = "\
//
// kernelmark test marker, written after a completed benchmark sweep
//
// machine: Target machine name
// kernel: Kernel version
// nr_cores: Logical CPUs of the target, multi-core runs use cores 0..nr_cores
// name_version: Result file name format version
// started_at: Sweep start time (UNIX epoch)
// ended_at: Sweep end time (UNIX epoch)
// nr_runs: Number of benchmark runs in the sweep
// nr_failed: Number of runs which didn't produce a result
//
";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestMarker {
    pub machine: String,
    pub kernel: String,
    pub nr_cores: u32,
    pub name_version: u32,
    pub started_at: u64,
    pub ended_at: u64,
    pub nr_runs: usize,
    pub nr_failed: usize,
}

impl JsonLoad for TestMarker {}

impl JsonSave for TestMarker {
    fn preamble() -> Option<String> {
        Some(MARKER_DOC.to_string())
    }
}

/// Build products a kernel directory needs before it can be deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub image: PathBuf,
    pub rootfs: PathBuf,
}

/// On-disk result tree:
///
///   ROOT/MACHINE/KERNEL/{IMAGE, ROOTFS, tested.json, RESULT_NAME...}
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub const MARKER_NAME: &'static str = "tested.json";

    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: PathBuf::from(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn create_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {:?}", &self.root))?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o777))
            .with_context(|| format!("chmod {:?}", &self.root))?;
        Ok(())
    }

    pub fn machine_dir(&self, machine: &str) -> PathBuf {
        self.root.join(machine)
    }

    pub fn kernel_dir(&self, machine: &str, kernel: &str) -> PathBuf {
        self.machine_dir(machine).join(kernel)
    }

    pub fn result_path(&self, machine: &str, spec: &RunSpec) -> PathBuf {
        self.kernel_dir(machine, &spec.kernel)
            .join(spec.result_name().to_string())
    }

    pub fn marker_path(&self, machine: &str, kernel: &str) -> PathBuf {
        self.kernel_dir(machine, kernel).join(Self::MARKER_NAME)
    }

    pub fn ensure_kernel_dir(&self, machine: &str, kernel: &str) -> Result<PathBuf> {
        if !self.root.exists() {
            self.create_root()?;
        }
        let dir = self.kernel_dir(machine, kernel);
        fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", &dir))?;
        Ok(dir)
    }

    /// Wipe results of all machines.
    pub fn nuke(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("removing {:?}", &self.root))?;
        }
        self.create_root()?;
        info!("store: Wiped {:?}", &self.root);
        Ok(())
    }

    /// Wipe results of `machine`.
    pub fn clean(&self, machine: &str) -> Result<()> {
        let dir = self.machine_dir(machine);
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("removing {:?}", &dir))?;
            info!("store: Wiped {:?}", &dir);
        }
        Ok(())
    }

    /// Locate the deployable artifacts of a built kernel.
    pub fn artifacts(
        &self,
        machine: &str,
        kernel: &str,
        image_glob: &str,
        rootfs_name: &str,
    ) -> Option<Artifacts> {
        let dir = self.kernel_dir(machine, kernel);
        let image = find_image(&dir, image_glob)?;
        let rootfs = dir.join(rootfs_name);
        if rootfs.is_file() {
            Some(Artifacts { image, rootfs })
        } else {
            None
        }
    }

    pub fn has_marker(&self, machine: &str, kernel: &str) -> bool {
        self.marker_path(machine, kernel).is_file()
    }

    pub fn load_marker(&self, machine: &str, kernel: &str) -> Option<TestMarker> {
        let path = self.marker_path(machine, kernel);
        if !path.exists() {
            return None;
        }
        match TestMarker::load(&path) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("store: Ignoring broken marker {:?} ({:#})", &path, &e);
                None
            }
        }
    }

    pub fn write_marker(&self, marker: &TestMarker) -> Result<()> {
        let path = self.marker_path(&marker.machine, &marker.kernel);
        let mut rep = JsonReportFile::<TestMarker>::new(Some(&path));
        rep.data = marker.clone();
        rep.commit()
            .with_context(|| format!("committing {:?}", &path))?;
        debug!("store: Wrote {:?}", &path);
        Ok(())
    }

    /// Kernel directories of `machine`, sorted by name.
    pub fn list_kernels(&self, machine: &str) -> Result<Vec<String>> {
        let dir = self.machine_dir(machine);
        let mut kernels = vec![];
        for ent in fs::read_dir(&dir).with_context(|| format!("reading {:?}", &dir))? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = ent.file_name().to_str() {
                kernels.push(name.to_string());
            }
        }
        kernels.sort();
        Ok(kernels)
    }

    /// Result file names in a kernel directory, sorted by name.
    pub fn list_results(&self, machine: &str, kernel: &str) -> Result<Vec<String>> {
        let dir = self.kernel_dir(machine, kernel);
        let mut names = vec![];
        for ent in fs::read_dir(&dir).with_context(|| format!("reading {:?}", &dir))? {
            let ent = ent?;
            if !ent.file_type()?.is_file() {
                continue;
            }
            match ent.file_name().to_str() {
                Some(name) if ResultName::is_result_file(name) => names.push(name.to_string()),
                _ => {}
            }
        }
        names.sort();
        Ok(names)
    }
}

/// First file in `dir` matching `pattern`.
pub fn find_image(dir: &Path, pattern: &str) -> Option<PathBuf> {
    let pat = dir.join(pattern);
    let pat = pat.to_str()?;
    match glob::glob(pat) {
        Ok(paths) => paths.filter_map(|p| p.ok()).find(|p| p.is_file()),
        Err(e) => {
            warn!("store: Invalid image pattern {:?} ({})", pat, &e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelmark_intf::{Direction, Protocol, Threading, Tool};
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_layout_and_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ResultStore::new(dir.path().join("output"));

        let spec = RunSpec {
            kernel: "5.19.17".into(),
            tool: Tool::Iperf3,
            protocol: Protocol::Tcp,
            direction: Direction::Bidir,
            threading: Threading::Multi(2),
            bandwidth: 500,
            packet_size: 1448,
        };
        assert_eq!(
            store.result_path("odroidc4", &spec),
            dir.path()
                .join("output/odroidc4/5.19.17/iperf3-mt2-tcp.bidir-500m-1448.test")
        );

        let kdir = store.ensure_kernel_dir("odroidc4", "5.19.17").unwrap();
        let mode = fs::metadata(store.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        assert!(store
            .artifacts("odroidc4", "5.19.17", "*Image", "rootfs.cpio")
            .is_none());
        fs::write(kdir.join("bzImage"), "img").unwrap();
        assert!(store
            .artifacts("odroidc4", "5.19.17", "*Image", "rootfs.cpio")
            .is_none());
        fs::write(kdir.join("rootfs.cpio"), "fs").unwrap();
        let arts = store
            .artifacts("odroidc4", "5.19.17", "*Image", "rootfs.cpio")
            .unwrap();
        assert_eq!(arts.image, kdir.join("bzImage"));

        fs::write(store.result_path("odroidc4", &spec), "{}").unwrap();
        fs::write(kdir.join("iperf3-st-tcp-1000m-90.log"), "").unwrap();
        assert_eq!(
            store.list_results("odroidc4", "5.19.17").unwrap(),
            vec!["iperf3-mt2-tcp.bidir-500m-1448.test".to_string()]
        );
        assert_eq!(
            store.list_kernels("odroidc4").unwrap(),
            vec!["5.19.17".to_string()]
        );
    }

    #[test]
    fn test_marker_and_clean() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ResultStore::new(dir.path());
        store.ensure_kernel_dir("odroidc4", "6.0.1").unwrap();
        store.ensure_kernel_dir("haswell3", "6.0.1").unwrap();

        assert!(!store.has_marker("odroidc4", "6.0.1"));
        assert!(store.load_marker("odroidc4", "6.0.1").is_none());

        let marker = TestMarker {
            machine: "odroidc4".into(),
            kernel: "6.0.1".into(),
            nr_cores: 4,
            name_version: ResultName::VERSION,
            ..Default::default()
        };
        store.write_marker(&marker).unwrap();
        assert!(store.has_marker("odroidc4", "6.0.1"));
        assert_eq!(store.load_marker("odroidc4", "6.0.1"), Some(marker));

        fs::write(store.marker_path("haswell3", "6.0.1"), "garbage").unwrap();
        assert!(store.load_marker("haswell3", "6.0.1").is_none());

        store.clean("odroidc4").unwrap();
        assert!(!store.machine_dir("odroidc4").exists());
        assert!(store.machine_dir("haswell3").exists());

        store.nuke().unwrap();
        assert!(store.root().exists());
        assert!(!store.machine_dir("haswell3").exists());
    }
}
