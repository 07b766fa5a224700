use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// `(host, port)`, totally ordered by `(host, port)`. Kept as a plain string
/// host rather than a resolved `IpAddr` because MOVED/ASK and `CLUSTER NODES`
/// hand back text that the proxy forwards on to `TcpStream::connect` as-is.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Address {
        Address {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> io::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve"))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Address, AddressParseError> {
        let (host, port) = s.rsplit_once(':').ok_or(AddressParseError)?;
        let port: u16 = port.parse().map_err(|_| AddressParseError)?;
        Ok(Address::new(host, port))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected host:port")
    }
}

impl std::error::Error for AddressParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let addr: Address = "127.0.0.1:7001".parse().unwrap();
        assert_eq!(addr, Address::new("127.0.0.1", 7001));
    }

    #[test]
    fn rejects_missing_port() {
        assert!("127.0.0.1".parse::<Address>().is_err());
    }

    #[test]
    fn orders_by_host_then_port() {
        let a = Address::new("a", 2);
        let b = Address::new("a", 3);
        let c = Address::new("b", 1);
        assert!(a < b);
        assert!(b < c);
    }
}
