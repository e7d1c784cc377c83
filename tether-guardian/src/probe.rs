use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_PORT_TRIES: u32 = 200;

/// Whether something is already listening on a local port.
pub trait PortProbe: Send + Sync {
    fn is_busy(&self, port: u16) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TcpPortProbe;

impl PortProbe for TcpPortProbe {
    fn is_busy(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
    }
}

/// First free port at or above `max(1024, start)`, trying at most 200.
pub fn find_free_port(probe: &dyn PortProbe, start: u32) -> Option<u16> {
    let first = start.max(1024);
    (first..first + MAX_PORT_TRIES)
        .filter_map(|p| u16::try_from(p).ok())
        .find(|p| !probe.is_busy(*p))
}

/// Resolve a bare command name against `PATH`.
pub fn find_on_path(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
