use anyhow::{bail, Context, Result};
use std::process::Command;
use tracing::{debug, warn};

/// The subset of `diskutil` used here.
pub trait DiskTool {
    fn run(&self, args: &[&str]) -> Result<String>;

    fn is_uas(&self, bsd_name: &str) -> bool {
        match self.run(&["info", bsd_name]) {
            Ok(info) => is_uas(&info),
            Err(err) => {
                debug!(disk = bsd_name, error = %err, "diskutil info failed");
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Diskutil;

impl DiskTool for Diskutil {
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("diskutil")
            .args(args)
            .output()
            .with_context(|| format!("run diskutil {}", args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "diskutil {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Value of a `Key: value` line in `diskutil info` output, which pads keys
/// with spaces.
pub fn info_value<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name.trim() == key).then(|| value.trim())
    })
}

pub fn is_uas(info: &str) -> bool {
    info_value(info, "Protocol") == Some("USB") && info_value(info, "Transport") == Some("UAS")
}

/// Unmounts a whole disk for the lifetime of the guard and remounts it on
/// drop, whatever happened in between.
pub struct MountGuard<'a, T: DiskTool + ?Sized> {
    tool: &'a T,
    disk: String,
}

impl<'a, T: DiskTool + ?Sized> MountGuard<'a, T> {
    pub fn unmount(tool: &'a T, disk: &str) -> Self {
        match tool.run(&["unmountDisk", disk]) {
            Ok(_) => debug!(disk, "unmounted for raw access"),
            Err(err) => warn!(disk, error = %err, "unmount failed"),
        }
        Self {
            tool,
            disk: disk.to_string(),
        }
    }
}

impl<T: DiskTool + ?Sized> Drop for MountGuard<'_, T> {
    fn drop(&mut self) {
        match self.tool.run(&["mountDisk", &self.disk]) {
            Ok(_) => debug!(disk = %self.disk, "remounted"),
            Err(err) => warn!(disk = %self.disk, error = %err, "remount failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<String>>,
        fail_unmount: bool,
    }

    impl DiskTool for Recorder {
        fn run(&self, args: &[&str]) -> Result<String> {
            self.calls.borrow_mut().push(args.join(" "));
            if self.fail_unmount && args[0] == "unmountDisk" {
                return Err(anyhow!("busy"));
            }
            Ok(String::new())
        }
    }

    fn query(fail: bool) -> std::result::Result<(), &'static str> {
        if fail {
            Err("device stalled")
        } else {
            Ok(())
        }
    }

    #[test]
    fn remounts_after_success_and_failure() {
        let tool = Recorder::default();
        {
            let _guard = MountGuard::unmount(&tool, "disk4");
            assert!(query(false).is_ok());
        }
        let result = {
            let _guard = MountGuard::unmount(&tool, "disk4");
            query(true)
        };
        assert!(result.is_err());
        assert_eq!(
            *tool.calls.borrow(),
            vec![
                "unmountDisk disk4",
                "mountDisk disk4",
                "unmountDisk disk4",
                "mountDisk disk4"
            ]
        );
    }

    #[test]
    fn remounts_even_when_unmount_failed() {
        let tool = Recorder {
            fail_unmount: true,
            ..Recorder::default()
        };
        drop(MountGuard::unmount(&tool, "disk2"));
        assert_eq!(*tool.calls.borrow(), vec!["unmountDisk disk2", "mountDisk disk2"]);
    }

    #[test]
    fn detects_uas_from_padded_info() {
        let info = "   Device Identifier:         disk4\n   Protocol:                  USB\n   Transport:                 UAS\n";
        assert!(is_uas(info));
        assert!(!is_uas("   Protocol:                  USB\n   Transport:                 USB\n"));
        assert_eq!(info_value(info, "Device Identifier"), Some("disk4"));
    }
}
