//! Line protocol spoken by the name authority
//!
//! Requests are one whitespace-separated line; the command word is
//! case-insensitive. Responses are `<code> <message> <body>` for success
//! and `<code> ERROR <reason>` for failures, each terminated by `\n`.

use std::fmt;

use nexa_core::DnsRecord;

pub const STATUS_OK: u16 = 200;
pub const STATUS_CREATED: u16 = 201;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_SERVER_ERROR: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Resolve { name: String },
    Register(DnsRecord),
    Update(DnsRecord),
    Delete { name: String },
    List,
}

impl Request {
    /// Parse a request line. Failures come back as the response to send.
    pub fn parse(line: &str) -> std::result::Result<Self, Response> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            return Err(Response::error(STATUS_BAD_REQUEST, "Empty query"));
        };

        match command.to_ascii_uppercase().as_str() {
            "PING" => Ok(Request::Ping),
            "LIST" => Ok(Request::List),
            "RESOLVE" => match parts.get(1) {
                Some(name) => Ok(Request::Resolve { name: name.to_string() }),
                None => Err(Response::error(STATUS_BAD_REQUEST, "Usage: RESOLVE <name>")),
            },
            "DELETE" => match parts.get(1) {
                Some(name) => Ok(Request::Delete { name: name.to_string() }),
                None => Err(Response::error(STATUS_BAD_REQUEST, "Usage: DELETE <name>")),
            },
            "REGISTER" => parse_record(&parts, "REGISTER").map(Request::Register),
            "UPDATE" => parse_record(&parts, "UPDATE").map(Request::Update),
            _ => Err(Response::error(STATUS_BAD_REQUEST, "Unknown Command")),
        }
    }

    /// Wire form, without the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            Request::Ping => "PING".to_string(),
            Request::List => "LIST".to_string(),
            Request::Resolve { name } => format!("RESOLVE {}", name),
            Request::Delete { name } => format!("DELETE {}", name),
            Request::Register(r) => {
                format!("REGISTER {} {} {} {}", r.name, r.ip, r.port, r.service)
            }
            Request::Update(r) => format!("UPDATE {} {} {} {}", r.name, r.ip, r.port, r.service),
        }
    }
}

fn parse_record(parts: &[&str], command: &str) -> std::result::Result<DnsRecord, Response> {
    if parts.len() < 5 {
        return Err(Response::error(
            STATUS_BAD_REQUEST,
            format!("Usage: {} <name> <ip> <port> <service>", command),
        ));
    }
    let port = match parts[3].parse::<u16>() {
        Ok(p) if p > 0 => p,
        _ => return Err(Response::error(STATUS_BAD_REQUEST, "Invalid port number")),
    };
    Ok(DnsRecord::new(parts[1], parts[2], port, parts[4]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub message: String,
    pub body: String,
}

impl Response {
    pub fn ok(code: u16, message: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            body: body.into(),
        }
    }

    pub fn error(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            message: "ERROR".to_string(),
            body: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Parse a response line as sent by the authority
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim_end().splitn(3, ' ');
        let code = parts.next()?.parse().ok()?;
        let message = parts.next()?.to_string();
        let body = parts.next().unwrap_or_default().to_string();
        Some(Self { code, message, body })
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.body.is_empty() {
            write!(f, "{} {}", self.code, self.message)
        } else {
            write!(f, "{} {} {}", self.code, self.message, self.body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Request::parse("PING").unwrap(), Request::Ping);
        assert_eq!(Request::parse("  list  ").unwrap(), Request::List);
        assert_eq!(
            Request::parse("resolve demo.n").unwrap(),
            Request::Resolve { name: "demo.n".into() }
        );
        assert_eq!(
            Request::parse("DELETE demo.n").unwrap(),
            Request::Delete { name: "demo.n".into() }
        );
    }

    #[test]
    fn test_parse_register() {
        match Request::parse("REGISTER demo.n 10.0.0.5 9090 custom").unwrap() {
            Request::Register(r) => {
                assert_eq!(r.name, "demo.n");
                assert_eq!(r.ip, "10.0.0.5");
                assert_eq!(r.port, 9090);
                assert_eq!(r.service, "custom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_line_reparses() {
        let request = Request::Update(DnsRecord::new("a.n", "10.0.0.1", 80, "web"));
        assert_eq!(request.to_line(), "UPDATE a.n 10.0.0.1 80 web");
        assert!(matches!(Request::parse(&request.to_line()), Ok(Request::Update(_))));
    }

    #[test]
    fn test_response_format() {
        assert_eq!(
            Response::ok(STATUS_OK, "RESOLVED", "10.0.0.5:9090|service=custom").to_string(),
            "200 RESOLVED 10.0.0.5:9090|service=custom"
        );
        assert_eq!(
            Response::error(STATUS_NOT_FOUND, "Name not found").to_string(),
            "404 ERROR Name not found"
        );
        assert_eq!(Response::ok(STATUS_OK, "LIST", "").to_string(), "200 LIST");
    }

    #[test]
    fn test_response_parse() {
        let resp = Response::parse("200 PONG Records: 3\n").unwrap();
        assert_eq!(resp.code, 200);
        assert_eq!(resp.message, "PONG");
        assert_eq!(resp.body, "Records: 3");
        assert!(resp.is_success());

        let resp = Response::parse("200 LIST").unwrap();
        assert_eq!(resp.body, "");
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_unknown_command() {
        let err = Request::parse("FROB x").unwrap_err();
        assert_eq!(err.to_string(), "400 ERROR Unknown Command");
    }

    #[test]
    fn test_missing_arguments() {
        assert_eq!(
            Request::parse("RESOLVE").unwrap_err().to_string(),
            "400 ERROR Usage: RESOLVE <name>"
        );
        assert_eq!(
            Request::parse("REGISTER a.n 10.0.0.1 80").unwrap_err().to_string(),
            "400 ERROR Usage: REGISTER <name> <ip> <port> <service>"
        );
        assert_eq!(Request::parse("").unwrap_err().code, STATUS_BAD_REQUEST);
    }

    #[test]
    fn test_invalid_port() {
        for port in ["0", "65536", "-1", "abc"] {
            let line = format!("REGISTER a.n 10.0.0.1 {} web", port);
            assert_eq!(
                Request::parse(&line).unwrap_err().to_string(),
                "400 ERROR Invalid port number"
            );
        }
    }

    #[test]
    fn test_garbage_response() {
        assert!(Response::parse("").is_none());
        assert!(Response::parse("OK fine").is_none());
    }
}
