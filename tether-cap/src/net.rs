use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::{CapabilityPolicy, CapabilityViolation, SandboxAction, SandboxError};

pub trait Connection: Read + Write + Send {}

impl<T: Read + Write + Send> Connection for T {}

/// Opens outbound connections. Swapped for a fake in tests.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &str, timeout: Duration) -> io::Result<Box<dyn Connection>>;
}

pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: &str, timeout: Duration) -> io::Result<Box<dyn Connection>> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"));
        for sock in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock, timeout) {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

/// Network capability: outbound connections only if the policy grants them.
pub struct NetCap {
    allowed: bool,
    connector: Box<dyn Connector>,
}

impl NetCap {
    pub fn new(policy: &CapabilityPolicy) -> Self {
        Self::with_connector(policy, Box::new(TcpConnector))
    }

    pub fn with_connector(policy: &CapabilityPolicy, connector: Box<dyn Connector>) -> Self {
        Self {
            allowed: policy.permits_network(),
            connector,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn connect(&self, addr: &str, timeout: Duration) -> Result<Box<dyn Connection>, SandboxError> {
        if !self.allowed {
            return Err(CapabilityViolation::new(SandboxAction::Network, addr).into());
        }
        Ok(self.connector.connect(addr, timeout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeConnector {
        calls: Arc<AtomicUsize>,
    }

    impl Connector for FakeConnector {
        fn connect(&self, _addr: &str, _timeout: Duration) -> io::Result<Box<dyn Connection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(b"pong".to_vec())))
        }
    }

    fn policy(allow_network: bool) -> CapabilityPolicy {
        CapabilityPolicy {
            allowed_root: PathBuf::from("/srv"),
            strict: true,
            allow_subprocess: false,
            allow_network,
        }
    }

    #[test]
    fn undeclared_network_is_denied_before_connecting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let net = NetCap::with_connector(&policy(false), Box::new(FakeConnector { calls: calls.clone() }));
        let err = net.connect("example.com:443", Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, SandboxError::Violation(v) if v.action == SandboxAction::Network));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn declared_network_reaches_connector() {
        let calls = Arc::new(AtomicUsize::new(0));
        let net = NetCap::with_connector(&policy(true), Box::new(FakeConnector { calls: calls.clone() }));
        let mut conn = net.connect("example.com:443", Duration::from_secs(1)).unwrap();
        let mut buf = String::new();
        conn.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "pong");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
