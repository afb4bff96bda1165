#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Parsed `http://host:port` bind endpoint. The scheme is optional.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct HttpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl HttpEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse `http://host:port` or bare `host:port`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected http://host:port)".to_string());
			}

			let rest = s.strip_prefix("http://").unwrap_or(s);
			if rest.contains("://") {
				return Err(format!("unsupported scheme (expected http://host:port): {s}"));
			}

			let rest = rest.strip_suffix('/').unwrap_or(rest);
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected http://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port_str) = rest
				.rsplit_once(':')
				.ok_or_else(|| format!("invalid endpoint (missing :port, expected http://host:port): {s}"))?;

			let host = host.trim();
			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected http://host:port): {s}"));
			}

			if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
				return Err(format!(
					"invalid endpoint host (IPv6 must be bracketed like http://[::1]:5000): {s}"
				));
			}

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_with_and_without_scheme() {
			let e = HttpEndpoint::parse("http://0.0.0.0:5000").unwrap();
			assert_eq!(e.host, "0.0.0.0");
			assert_eq!(e.port, 5000);

			let e = HttpEndpoint::parse("127.0.0.1:8080/").unwrap();
			assert_eq!(e.hostport(), "127.0.0.1:8080");
		}

		#[test]
		fn parses_bracketed_ipv6() {
			let e = HttpEndpoint::parse("http://[::1]:5000").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:5000");
		}

		#[test]
		fn rejects_other_schemes_and_paths() {
			assert!(HttpEndpoint::parse("https://127.0.0.1:5000").is_err());
			assert!(HttpEndpoint::parse("http://127.0.0.1:5000/state").is_err());
			assert!(HttpEndpoint::parse("http://::1:5000").is_err());
		}

		#[test]
		fn rejects_port_zero_and_missing_port() {
			assert!(HttpEndpoint::parse("http://127.0.0.1:0").is_err());
			assert!(HttpEndpoint::parse("http://127.0.0.1").is_err());
		}

		#[test]
		fn dns_names_are_not_socket_addrs() {
			let e = HttpEndpoint::parse("http://subathon.local:5000").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
