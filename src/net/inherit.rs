//! Environment protocol describing descriptors passed to a successor.
//!
//! ```text
//! LIFELINE_READY_FD=3
//! LIFELINE_LISTEN_FDS=tcp|0.0.0.0:8080|4;tcp|127.0.0.1:9090|5
//! ```
//! The address is the one the predecessor asked for in `listen`, so a
//! successor running the same configuration finds it again.

use std::os::fd::RawFd;

use super::handoff::HandoffError;

pub const READY_FD_ENV: &str = "LIFELINE_READY_FD";
pub const LISTEN_FDS_ENV: &str = "LIFELINE_LISTEN_FDS";

/// Descriptor number the readiness pipe lands on in the successor.
pub const READY_FD: RawFd = 3;

/// First descriptor number used for listeners in the successor.
pub const FIRST_LISTEN_FD: RawFd = 4;

/// One listening socket described in `LIFELINE_LISTEN_FDS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedFd {
    pub network: String,
    pub address: String,
    pub fd: RawFd,
}

pub fn encode_listeners(listeners: &[InheritedFd]) -> String {
    listeners
        .iter()
        .map(|l| format!("{}|{}|{}", l.network, l.address, l.fd))
        .collect::<Vec<_>>()
        .join(";")
}

pub fn parse_listeners(raw: &str) -> Result<Vec<InheritedFd>, HandoffError> {
    raw.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let mut fields = part.trim().splitn(3, '|');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(network), Some(address), Some(fd)) if !network.is_empty() && !address.is_empty() => {
                    Ok(InheritedFd {
                        network: network.to_string(),
                        address: address.to_string(),
                        fd: parse_fd(fd)?,
                    })
                }
                _ => Err(HandoffError::InvalidInheritance(format!("malformed listener entry `{part}`"))),
            }
        })
        .collect()
}

pub fn parse_fd(raw: &str) -> Result<RawFd, HandoffError> {
    match raw.trim().parse::<RawFd>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(HandoffError::InvalidInheritance(format!("invalid descriptor `{raw}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_round_trip() {
        let listeners = vec![
            InheritedFd {
                network: "tcp".into(),
                address: "0.0.0.0:8080".into(),
                fd: 4,
            },
            InheritedFd {
                network: "tcp".into(),
                address: "[::1]:9090".into(),
                fd: 5,
            },
        ];
        let encoded = encode_listeners(&listeners);
        assert_eq!(encoded, "tcp|0.0.0.0:8080|4;tcp|[::1]:9090|5");
        assert_eq!(parse_listeners(&encoded).unwrap(), listeners);
    }

    #[test]
    fn empty_value_means_nothing_inherited() {
        assert!(parse_listeners("").unwrap().is_empty());
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(matches!(
            parse_listeners("tcp|0.0.0.0:8080"),
            Err(HandoffError::InvalidInheritance(_))
        ));
        assert!(matches!(
            parse_listeners("tcp|0.0.0.0:8080|-1"),
            Err(HandoffError::InvalidInheritance(_))
        ));
        assert!(parse_fd("three").is_err());
    }
}
