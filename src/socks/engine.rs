//! SOCKS5 protocol engine
//!
//! A pure state machine over byte buffers. Each step takes the bytes
//! received so far and returns the decoded message together with how many
//! bytes it occupied; the caller owns all socket I/O.
//!
//! # Request Format
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```

use super::consts::*;
use super::types::{
    AuthMethod, AuthOutcome, ConnectRequest, Greeting, Phase, Socks5Credentials, TargetAddr,
};
use crate::error::{Socks5Error, Socks5ReplyCode};
use std::net::Ipv4Addr;

/// Which methods a listener is willing to negotiate
#[derive(Debug, Clone)]
enum Mode {
    /// Username/password gating when credentials are configured
    Authenticated(Option<Socks5Credentials>),
    /// No-auth only
    Open,
}

/// SOCKS5 negotiation engine shared by both listener variants
#[derive(Debug, Clone)]
pub struct Socks5Engine {
    mode: Mode,
}

impl Socks5Engine {
    /// Engine for the static listener, optionally gated by credentials
    pub fn authenticated(credentials: Option<Socks5Credentials>) -> Self {
        Socks5Engine {
            mode: Mode::Authenticated(credentials),
        }
    }

    /// Engine for the dynamic listener; only ever selects no-auth
    pub fn open() -> Self {
        Socks5Engine { mode: Mode::Open }
    }

    /// Whether this engine can ever ask for a username/password
    pub fn has_credentials(&self) -> bool {
        matches!(self.mode, Mode::Authenticated(Some(_)))
    }

    /// Parse a client greeting and select a method.
    ///
    /// A `NoAcceptable` selection is not an error here: the caller must
    /// still send [`Greeting::reply`] before dropping the client.
    pub fn handshake(&self, buf: &[u8]) -> Result<Greeting, Socks5Error> {
        if buf.len() < 2 {
            return Err(Socks5Error::Truncated {
                stage: "handshake",
                needed: 2,
                got: buf.len(),
            });
        }

        if buf[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(buf[0]));
        }

        let nmethods = buf[1] as usize;
        let needed = 2 + nmethods;
        if buf.len() < needed {
            return Err(Socks5Error::Truncated {
                stage: "handshake",
                needed,
                got: buf.len(),
            });
        }

        let methods = &buf[2..needed];
        let method = self.select_method(methods);

        Ok(Greeting {
            method,
            consumed: needed,
        })
    }

    fn select_method(&self, methods: &[u8]) -> AuthMethod {
        let offers_password = methods.contains(&SOCKS5_AUTH_METHOD_PASSWORD);
        let offers_none = methods.contains(&SOCKS5_AUTH_METHOD_NONE);

        match &self.mode {
            Mode::Authenticated(Some(_)) if offers_password => AuthMethod::UserPass,
            _ if offers_none => AuthMethod::NoAuth,
            _ => AuthMethod::NoAcceptable,
        }
    }

    /// Phase that follows a greeting once its reply has been written
    pub fn after_handshake(&self, greeting: &Greeting) -> Result<Phase, Socks5Error> {
        match greeting.method {
            AuthMethod::NoAuth => Ok(Phase::AwaitingRequest),
            AuthMethod::UserPass => Ok(Phase::AwaitingAuth),
            AuthMethod::NoAcceptable => Err(Socks5Error::NoAcceptableMethod),
        }
    }

    /// Check a username/password sub-negotiation (RFC 1929).
    ///
    /// A wrong sub-negotiation version is treated as a rejected login so
    /// that the client still receives a failure status.
    pub fn authenticate(&self, buf: &[u8]) -> Result<AuthOutcome, Socks5Error> {
        let truncated = |needed: usize| Socks5Error::Truncated {
            stage: "auth",
            needed,
            got: buf.len(),
        };

        if buf.len() < 2 {
            return Err(truncated(2));
        }

        let ulen = buf[1] as usize;
        let plen_at = 2 + ulen;
        if buf.len() < plen_at + 1 {
            return Err(truncated(plen_at + 1));
        }

        let plen = buf[plen_at] as usize;
        let end = plen_at + 1 + plen;
        if buf.len() < end {
            return Err(truncated(end));
        }

        let username = &buf[2..plen_at];
        let password = &buf[plen_at + 1..end];

        let accepted = buf[0] == SOCKS5_AUTH_VERSION
            && match &self.mode {
                Mode::Authenticated(Some(creds)) => creds.matches(username, password),
                _ => false,
            };

        Ok(AuthOutcome {
            accepted,
            username: String::from_utf8_lossy(username).into_owned(),
            consumed: end,
        })
    }

    /// Phase that follows an auth outcome once its reply has been written
    pub fn after_auth(&self, outcome: &AuthOutcome) -> Result<Phase, Socks5Error> {
        if outcome.accepted {
            Ok(Phase::AwaitingRequest)
        } else {
            Err(Socks5Error::AuthFailed)
        }
    }

    /// Decode a CONNECT request.
    ///
    /// Errors carrying a [`Socks5Error::reply_code`] must be answered with
    /// [`encode_reply`] before the socket is dropped.
    pub fn parse_request(&self, buf: &[u8]) -> Result<ConnectRequest, Socks5Error> {
        let truncated = |needed: usize| Socks5Error::Truncated {
            stage: "request",
            needed,
            got: buf.len(),
        };

        if buf.len() < SOCKS5_MIN_REQUEST_LEN {
            return Err(truncated(SOCKS5_MIN_REQUEST_LEN));
        }

        if buf[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(buf[0]));
        }

        if buf[1] != SOCKS5_CMD_TCP_CONNECT {
            return Err(Socks5Error::CommandNotSupported(buf[1]));
        }

        let (target, consumed) = match buf[3] {
            SOCKS5_ADDR_TYPE_IPV4 => {
                let end = 4 + 4 + 2;
                if buf.len() < end {
                    return Err(truncated(end));
                }
                let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                (TargetAddr::Ipv4(ip, read_port(&buf[8..end])), end)
            }

            SOCKS5_ADDR_TYPE_DOMAIN => {
                let len = buf[4] as usize;
                if len == 0 {
                    return Err(Socks5Error::InvalidDomain(String::new()));
                }
                let end = 5 + len + 2;
                if buf.len() < end {
                    return Err(truncated(end));
                }
                let domain = std::str::from_utf8(&buf[5..5 + len])
                    .map_err(|_| {
                        Socks5Error::InvalidDomain(
                            String::from_utf8_lossy(&buf[5..5 + len]).into_owned(),
                        )
                    })?
                    .to_string();
                (TargetAddr::Domain(domain, read_port(&buf[5 + len..end])), end)
            }

            SOCKS5_ADDR_TYPE_IPV6 => {
                let end = 4 + 16 + 2;
                if buf.len() < end {
                    return Err(truncated(end));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[4..20]);
                (TargetAddr::Ipv6(octets, read_port(&buf[20..end])), end)
            }

            other => return Err(Socks5Error::AddressTypeNotSupported(other)),
        };

        tracing::debug!(target_addr = %target, "Parsed SOCKS5 CONNECT request");

        Ok(ConnectRequest { target, consumed })
    }
}

fn read_port(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Encode the fixed 10-byte reply frame.
///
/// The bound address is always reported as `0.0.0.0:0`.
pub fn encode_reply(code: Socks5ReplyCode) -> [u8; SOCKS5_REPLY_LEN] {
    [
        SOCKS5_VERSION,
        code.into(),
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

/// Encode a CONNECT request as a client would send it
pub fn encode_connect_request(target: &TargetAddr) -> Vec<u8> {
    let mut request = vec![
        SOCKS5_VERSION,
        SOCKS5_CMD_TCP_CONNECT,
        SOCKS5_RESERVED,
        target.addr_type(),
    ];

    match target {
        TargetAddr::Ipv4(ip, _) => request.extend_from_slice(&ip.octets()),
        TargetAddr::Domain(domain, _) => {
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
        }
        TargetAddr::Ipv6(octets, _) => request.extend_from_slice(octets),
    }

    request.extend_from_slice(&target.port().to_be_bytes());
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Option<Socks5Credentials> {
        Some(Socks5Credentials::new("admin", "hunter2"))
    }

    fn auth_request(version: u8, user: &[u8], pass: &[u8]) -> Vec<u8> {
        let mut buf = vec![version, user.len() as u8];
        buf.extend_from_slice(user);
        buf.push(pass.len() as u8);
        buf.extend_from_slice(pass);
        buf
    }

    #[test]
    fn test_open_engine_selects_no_auth() {
        let engine = Socks5Engine::open();
        for methods in [vec![0x00], vec![0x02, 0x00], vec![0x00, 0x02, 0x01]] {
            let mut buf = vec![SOCKS5_VERSION, methods.len() as u8];
            buf.extend_from_slice(&methods);
            let greeting = engine.handshake(&buf).unwrap();
            assert_eq!(greeting.method, AuthMethod::NoAuth);
            assert_eq!(greeting.consumed, buf.len());
        }
    }

    #[test]
    fn test_open_engine_never_selects_password() {
        let engine = Socks5Engine::open();
        let greeting = engine.handshake(&[0x05, 0x01, 0x02]).unwrap();
        assert_eq!(greeting.method, AuthMethod::NoAcceptable);
        assert_eq!(greeting.reply(), [0x05, 0xFF]);
        assert_eq!(
            engine.after_handshake(&greeting),
            Err(Socks5Error::NoAcceptableMethod)
        );
    }

    #[test]
    fn test_method_selection_truth_table() {
        // (credentials configured, offered methods, expected)
        let cases: Vec<(bool, Vec<u8>, AuthMethod)> = vec![
            (true, vec![0x00, 0x02], AuthMethod::UserPass),
            (true, vec![0x02], AuthMethod::UserPass),
            (true, vec![0x00], AuthMethod::NoAuth),
            (true, vec![0x01], AuthMethod::NoAcceptable),
            (false, vec![0x00, 0x02], AuthMethod::NoAuth),
            (false, vec![0x00], AuthMethod::NoAuth),
            (false, vec![0x02], AuthMethod::NoAcceptable),
            (false, vec![], AuthMethod::NoAcceptable),
        ];

        for (with_creds, methods, expected) in cases {
            let engine = Socks5Engine::authenticated(if with_creds { creds() } else { None });
            let mut buf = vec![SOCKS5_VERSION, methods.len() as u8];
            buf.extend_from_slice(&methods);
            let greeting = engine.handshake(&buf).unwrap();
            assert_eq!(
                greeting.method, expected,
                "creds={} methods={:?}",
                with_creds, methods
            );
        }
    }

    #[test]
    fn test_handshake_phase_transitions() {
        let engine = Socks5Engine::authenticated(creds());
        let greeting = engine.handshake(&[0x05, 0x01, 0x02]).unwrap();
        assert_eq!(engine.after_handshake(&greeting), Ok(Phase::AwaitingAuth));

        let greeting = engine.handshake(&[0x05, 0x01, 0x00]).unwrap();
        assert_eq!(
            engine.after_handshake(&greeting),
            Ok(Phase::AwaitingRequest)
        );
    }

    #[test]
    fn test_handshake_rejects_wrong_version() {
        let engine = Socks5Engine::open();
        assert_eq!(
            engine.handshake(&[0x04, 0x01, 0x00]),
            Err(Socks5Error::UnsupportedVersion(4))
        );
    }

    #[test]
    fn test_handshake_rejects_short_buffer() {
        let engine = Socks5Engine::open();
        assert!(matches!(
            engine.handshake(&[0x05]),
            Err(Socks5Error::Truncated { needed: 2, got: 1, .. })
        ));
        // Declares five methods, carries two
        assert!(matches!(
            engine.handshake(&[0x05, 0x05, 0x00, 0x02]),
            Err(Socks5Error::Truncated { needed: 7, got: 4, .. })
        ));
    }

    #[test]
    fn test_handshake_reports_consumed_with_trailing_bytes() {
        let engine = Socks5Engine::open();
        let greeting = engine
            .handshake(&[0x05, 0x01, 0x00, 0x05, 0x01, 0x00])
            .unwrap();
        assert_eq!(greeting.consumed, 3);
    }

    #[test]
    fn test_authenticate_success() {
        let engine = Socks5Engine::authenticated(creds());
        let buf = auth_request(0x01, b"admin", b"hunter2");
        let outcome = engine.authenticate(&buf).unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.username, "admin");
        assert_eq!(outcome.consumed, buf.len());
        assert_eq!(outcome.reply(), [0x01, 0x00]);
        assert_eq!(engine.after_auth(&outcome), Ok(Phase::AwaitingRequest));
    }

    #[test]
    fn test_authenticate_wrong_password() {
        let engine = Socks5Engine::authenticated(creds());
        let outcome = engine
            .authenticate(&auth_request(0x01, b"admin", b"hunter3"))
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.reply(), [0x01, 0x01]);
        assert_eq!(engine.after_auth(&outcome), Err(Socks5Error::AuthFailed));
    }

    #[test]
    fn test_authenticate_wrong_subversion_is_rejected() {
        let engine = Socks5Engine::authenticated(creds());
        let outcome = engine
            .authenticate(&auth_request(0x05, b"admin", b"hunter2"))
            .unwrap();
        assert!(!outcome.accepted);
    }

    #[test]
    fn test_authenticate_truncated() {
        let engine = Socks5Engine::authenticated(creds());
        let mut buf = auth_request(0x01, b"admin", b"hunter2");
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            engine.authenticate(&buf),
            Err(Socks5Error::Truncated { stage: "auth", .. })
        ));
        assert!(matches!(
            engine.authenticate(&[0x01, 0x05, b'a']),
            Err(Socks5Error::Truncated { stage: "auth", .. })
        ));
    }

    #[test]
    fn test_authenticate_without_credentials_rejects() {
        let engine = Socks5Engine::open();
        let outcome = engine.authenticate(&auth_request(0x01, b"", b"")).unwrap();
        assert!(!outcome.accepted);
    }

    #[test]
    fn test_request_roundtrip_all_address_types() {
        let engine = Socks5Engine::open();
        let mut v6 = [0u8; 16];
        v6[15] = 1;
        let targets = vec![
            TargetAddr::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 80),
            TargetAddr::Domain("example.com".to_string(), 443),
            TargetAddr::Ipv6(v6, 8443),
        ];

        for target in targets {
            let buf = encode_connect_request(&target);
            let request = engine.parse_request(&buf).unwrap();
            assert_eq!(request.target, target);
            assert_eq!(request.consumed, buf.len());
        }
    }

    #[test]
    fn test_request_ipv4_dotted() {
        let engine = Socks5Engine::open();
        let buf = [0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x1F, 0x90];
        let request = engine.parse_request(&buf).unwrap();
        assert_eq!(request.target.host(), "10.0.0.5");
        assert_eq!(request.target.port(), 8080);
    }

    #[test]
    fn test_request_unsupported_command() {
        let engine = Socks5Engine::open();
        for cmd in [0x02u8, 0x03] {
            let buf = [0x05, cmd, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
            let err = engine.parse_request(&buf).unwrap_err();
            assert_eq!(err, Socks5Error::CommandNotSupported(cmd));
            assert_eq!(
                err.reply_code(),
                Some(Socks5ReplyCode::CommandNotSupported)
            );
        }
    }

    #[test]
    fn test_request_unsupported_address_type() {
        let engine = Socks5Engine::open();
        let buf = [0x05, 0x01, 0x00, 0x02, 127, 0, 0, 1, 0, 80];
        let err = engine.parse_request(&buf).unwrap_err();
        assert_eq!(err, Socks5Error::AddressTypeNotSupported(0x02));
        assert_eq!(
            err.reply_code(),
            Some(Socks5ReplyCode::AddressTypeNotSupported)
        );
    }

    #[test]
    fn test_request_truncated_has_no_reply() {
        let engine = Socks5Engine::open();
        let err = engine.parse_request(&[0x05, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, Socks5Error::Truncated { .. }));
        assert_eq!(err.reply_code(), None);

        // IPv6 header with only eight address bytes
        let mut buf = vec![0x05, 0x01, 0x00, 0x04];
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            engine.parse_request(&buf),
            Err(Socks5Error::Truncated { needed: 22, .. })
        ));

        // Domain declares more bytes than present
        let buf = [0x05, 0x01, 0x00, 0x03, 20, b'a', b'b', 0, 80];
        assert!(matches!(
            engine.parse_request(&buf),
            Err(Socks5Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_request_wrong_version() {
        let engine = Socks5Engine::open();
        let buf = [0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        assert_eq!(
            engine.parse_request(&buf),
            Err(Socks5Error::UnsupportedVersion(4))
        );
    }

    #[test]
    fn test_request_invalid_domain() {
        let engine = Socks5Engine::open();
        let buf = [0x05, 0x01, 0x00, 0x03, 0, 0, 80];
        let err = engine.parse_request(&buf).unwrap_err();
        assert!(matches!(err, Socks5Error::InvalidDomain(_)));
        assert_eq!(err.reply_code(), Some(Socks5ReplyCode::HostUnreachable));

        let buf = [0x05, 0x01, 0x00, 0x03, 2, 0xFF, 0xFE, 0, 80];
        let err = engine.parse_request(&buf).unwrap_err();
        assert!(matches!(err, Socks5Error::InvalidDomain(_)));
        assert_eq!(err.reply_code(), Some(Socks5ReplyCode::HostUnreachable));
    }

    #[test]
    fn test_encode_reply_is_fixed_frame() {
        for byte in 0x00..=0x08u8 {
            let code = Socks5ReplyCode::try_from(byte).unwrap();
            let frame = encode_reply(code);
            assert_eq!(frame.len(), 10);
            assert_eq!(frame[0], SOCKS5_VERSION);
            assert_eq!(frame[1], byte);
            assert_eq!(frame[2], 0x00);
            assert_eq!(frame[3], SOCKS5_ADDR_TYPE_IPV4);
            assert!(frame[4..].iter().all(|b| *b == 0));
        }
    }
}
