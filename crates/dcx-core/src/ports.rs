//! Port-forwarding spec parsing
//!
//! `forwardPorts` entries are free-form strings (or bare numbers stringified by the
//! resolver) in one of: `N`, `HOST:CONTAINER`, `HOST_IP:HOST:CONTAINER`, each optionally
//! suffixed with `/tcp` or `/udp`. This mirrors Docker's own `-p` flag grammar closely
//! enough that a valid entry can be passed straight through; a bare `N` expands to
//! `N:N` (forward the same port number from host to container).

/// Parse one `forwardPorts` entry into a Docker `-p`-compatible argument, or `None` if
/// the entry is malformed. Malformed entries are dropped by the caller, not propagated
/// as an error.
pub fn parse_forward_port(spec: &str) -> Option<String> {
    let (main, proto) = match spec.split_once('/') {
        Some((main, proto)) => (main, Some(proto)),
        None => (spec, None),
    };
    if let Some(proto) = proto {
        if proto != "tcp" && proto != "udp" {
            return None;
        }
    }

    let fields: Vec<&str> = main.split(':').collect();
    let base = match fields.as_slice() {
        [port] => {
            let port = parse_port(port)?;
            format!("{port}:{port}")
        }
        [host, container] => {
            let host = parse_port(host)?;
            let container = parse_port(container)?;
            format!("{host}:{container}")
        }
        [host_ip, host, container] => {
            if host_ip.parse::<std::net::IpAddr>().is_err() {
                return None;
            }
            let host = parse_port(host)?;
            let container = parse_port(container)?;
            format!("{host_ip}:{host}:{container}")
        }
        _ => return None,
    };

    Some(match proto {
        Some(proto) => format!("{base}/{proto}"),
        None => base,
    })
}

fn parse_port(s: &str) -> Option<u16> {
    match s.parse::<u16>() {
        Ok(0) => None,
        Ok(port) => Some(port),
        Err(_) => None,
    }
}

/// Parse every entry, silently dropping invalid ones, per the wire-surface contract.
pub fn parse_forward_ports<'a>(specs: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    specs
        .into_iter()
        .filter_map(|spec| {
            let parsed = parse_forward_port(spec);
            if parsed.is_none() {
                tracing::warn!(spec = %spec, "dropping invalid forwardPorts entry");
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_port_expands_to_host_container() {
        assert_eq!(parse_forward_port("3000").as_deref(), Some("3000:3000"));
    }

    #[test]
    fn test_host_container_pair_passes_through() {
        assert_eq!(parse_forward_port("3000:3001").as_deref(), Some("3000:3001"));
    }

    #[test]
    fn test_host_ip_host_container_triple() {
        assert_eq!(
            parse_forward_port("127.0.0.1:3000:3001").as_deref(),
            Some("127.0.0.1:3000:3001")
        );
    }

    #[test]
    fn test_proto_suffix_preserved() {
        assert_eq!(parse_forward_port("3000:3001/udp").as_deref(), Some("3000:3001/udp"));
        assert_eq!(parse_forward_port("3000/tcp").as_deref(), Some("3000:3000/tcp"));
    }

    #[test]
    fn test_invalid_proto_is_dropped() {
        assert_eq!(parse_forward_port("3000/sctp"), None);
    }

    #[test]
    fn test_zero_port_is_dropped() {
        assert_eq!(parse_forward_port("0"), None);
    }

    #[test]
    fn test_non_numeric_port_is_dropped() {
        assert_eq!(parse_forward_port("abc"), None);
    }

    #[test]
    fn test_invalid_host_ip_is_dropped() {
        assert_eq!(parse_forward_port("not-an-ip:3000:3001"), None);
    }

    #[test]
    fn test_too_many_fields_is_dropped() {
        assert_eq!(parse_forward_port("1:2:3:4"), None);
    }

    #[test]
    fn test_parse_forward_ports_drops_invalid_keeps_valid() {
        let specs = vec!["3000".to_string(), "bad".to_string(), "8080:8081/tcp".to_string()];
        let parsed = parse_forward_ports(&specs);
        assert_eq!(parsed, vec!["3000:3000".to_string(), "8080:8081/tcp".to_string()]);
    }
}
