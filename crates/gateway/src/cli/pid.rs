//! Gateway pid-file management (`gateway start|stop|restart`).

use std::path::{Path, PathBuf};

#[cfg(not(unix))]
use oc_domain::error::Error;
use oc_domain::error::Result;

fn pid_path(state_dir: &Path) -> PathBuf {
    state_dir.join("gateway.pid")
}

/// Record this process as the running gateway.
pub fn write_pid(state_dir: &Path) -> Result<()> {
    std::fs::write(pid_path(state_dir), std::process::id().to_string())?;
    Ok(())
}

pub fn read_pid(state_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path(state_dir))
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn clear_pid(state_dir: &Path) {
    let _ = std::fs::remove_file(pid_path(state_dir));
}

/// Stop the recorded gateway process. Returns `false` when none runs.
pub fn stop(state_dir: &Path) -> Result<bool> {
    let Some(pid) = read_pid(state_dir) else {
        return Ok(false);
    };
    #[cfg(unix)]
    {
        // Safety: kill with a valid signal on an arbitrary pid is safe; a
        // stale pid yields ESRCH which we treat as "not running".
        let killed = unsafe { libc_kill(pid as i32) };
        clear_pid(state_dir);
        return Ok(killed);
    }
    #[cfg(not(unix))]
    {
        clear_pid(state_dir);
        Err(Error::Other("gateway stop is unix-only".into()))
    }
}

#[cfg(unix)]
unsafe fn libc_kill(pid: i32) -> bool {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    const SIGTERM: i32 = 15;
    kill(pid, SIGTERM) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_pid(dir.path()).unwrap();
        assert_eq!(read_pid(dir.path()), Some(std::process::id()));
        clear_pid(dir.path());
        assert_eq!(read_pid(dir.path()), None);
    }

    #[test]
    fn stop_without_pid_file_is_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!stop(dir.path()).unwrap());
    }
}
