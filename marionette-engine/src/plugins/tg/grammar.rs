//! Cover-traffic templates and the built-in grammars.

use std::collections::HashMap;

/// Longest message a framing will look through before giving up.
pub const MAX_FRAME: usize = 1 << 20;

const URL_REGEX: &str = r"^[a-zA-Z0-9?\-.&]+$";
const URL_LEN: usize = 2048;
const BODY_REGEX: &str = "^.*$";
const BODY_LEN: usize = 1024;
const DNS_LABEL_REGEX: &str = "^[a-z0-9]+$";
const DNS_LABEL_LEN: usize = 63;

/// How a complete message is delimited in the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
	/// Message ends right after the first occurrence of the terminator.
	Terminator(&'static [u8]),
	/// One CRLF-terminated line.
	Line,
	/// HTTP head followed by `Content-Length` bytes of body.
	HttpContentLength,
	/// Big-endian `u16` length followed by that many bytes.
	U16LengthPrefix,
}

/// Outcome of looking for one message at the head of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
	Complete(usize),
	Incomplete,
	Invalid,
}

impl Framing {
	pub fn frame(&self, buf: &[u8]) -> Frame {
		match self {
			Framing::Terminator(t) => terminated(buf, t),
			Framing::Line => terminated(buf, b"\r\n"),
			Framing::HttpContentLength => {
				let head_end = match terminated(buf, b"\r\n\r\n") {
					Frame::Complete(n) => n,
					other => return other,
				};
				let head = String::from_utf8_lossy(&buf[..head_end]);
				let length = head.split("\r\n").find_map(|line| {
					let (name, value) = line.split_once(':')?;
					name.trim().eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
				});
				match length.and_then(|len| head_end.checked_add(len)) {
					Some(total) if total > MAX_FRAME => Frame::Invalid,
					Some(total) if buf.len() >= total => Frame::Complete(total),
					Some(_) => Frame::Incomplete,
					None => Frame::Invalid,
				}
			}
			Framing::U16LengthPrefix => {
				if buf.len() < 2 {
					return Frame::Incomplete;
				}
				let total = 2 + usize::from(u16::from_be_bytes([buf[0], buf[1]]));
				if buf.len() >= total {
					Frame::Complete(total)
				} else {
					Frame::Incomplete
				}
			}
		}
	}
}

fn terminated(buf: &[u8], terminator: &[u8]) -> Frame {
	match find(buf, terminator) {
		Some(i) => Frame::Complete(i + terminator.len()),
		None if buf.len() > MAX_FRAME => Frame::Invalid,
		None => Frame::Incomplete,
	}
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	if needle.is_empty() {
		return Some(0);
	}
	haystack.windows(needle.len()).position(|w| w == needle)
}

/// What fills one `%%KEY%%` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotKind {
	/// Cell bytes ranked into a word of a regular language.
	Ranker { regex: &'static str, msg_len: usize },
	/// Cell bytes encrypted with a format-transforming cipher.
	Fte { regex: &'static str, msg_len: usize },
	/// Decimal byte length of another slot.
	ContentLength { of: &'static str },
	/// FTP `p1,p2` port taken from a session variable.
	PasvPort { var: &'static str },
	/// Two-byte DNS transaction id shared through a session variable.
	DnsTransactionId { var: &'static str },
	/// Two-byte DNS-over-TCP length covering the rest of the message.
	DnsLength,
}

impl SlotKind {
	/// Fixed byte width, for slots that are not delimited by the literal after them.
	pub fn width(&self) -> Option<usize> {
		match self {
			SlotKind::DnsTransactionId { .. } | SlotKind::DnsLength => Some(2),
			_ => None,
		}
	}

	pub fn is_carrier(&self) -> bool {
		matches!(self, SlotKind::Ranker { .. } | SlotKind::Fte { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
	Literal(Vec<u8>),
	Slot(String),
}

/// Literal bytes interleaved with named slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
	pieces: Vec<Piece>,
}

impl Template {
	/// Split `src` on `%%KEY%%` markers. An unterminated marker stays literal.
	pub fn parse(src: &[u8]) -> Self {
		let mut pieces = Vec::new();
		let mut rest = src;
		while let Some(open) = find(rest, b"%%") {
			let after = &rest[open + 2..];
			let Some(close) = find(after, b"%%") else { break };
			if open > 0 {
				pieces.push(Piece::Literal(rest[..open].to_vec()));
			}
			pieces.push(Piece::Slot(String::from_utf8_lossy(&after[..close]).into_owned()));
			rest = &after[close + 2..];
		}
		if !rest.is_empty() {
			pieces.push(Piece::Literal(rest.to_vec()));
		}
		Self { pieces }
	}

	pub fn pieces(&self) -> &[Piece] {
		&self.pieces
	}

	/// Slot keys in template order.
	pub fn slots(&self) -> impl Iterator<Item = &str> {
		self.pieces.iter().filter_map(|p| match p {
			Piece::Slot(k) => Some(k.as_str()),
			Piece::Literal(_) => None,
		})
	}

	/// Substitute every slot. `None` names the first missing key.
	pub fn render(&self, values: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>, String> {
		let mut out = Vec::new();
		for piece in &self.pieces {
			match piece {
				Piece::Literal(l) => out.extend_from_slice(l),
				Piece::Slot(k) => out.extend_from_slice(values.get(k).ok_or_else(|| k.clone())?),
			}
		}
		Ok(out)
	}

	/// Match a whole message, returning the bytes of every slot. A slot
	/// without a fixed width runs up to the next literal, or to the end.
	pub fn extract(&self, msg: &[u8], width: impl Fn(&str) -> Option<usize>) -> Option<HashMap<String, Vec<u8>>> {
		let mut values = HashMap::new();
		let mut at = 0;
		for (i, piece) in self.pieces.iter().enumerate() {
			match piece {
				Piece::Literal(l) => {
					if !msg[at..].starts_with(l) {
						return None;
					}
					at += l.len();
				}
				Piece::Slot(k) => {
					let end = match width(k) {
						Some(w) => at.checked_add(w).filter(|&e| e <= msg.len())?,
						None => match self.pieces.get(i + 1) {
							Some(Piece::Literal(next)) => at + find(&msg[at..], next)?,
							Some(Piece::Slot(_)) => return None,
							None => msg.len(),
						},
					};
					values.insert(k.clone(), msg[at..end].to_vec());
					at = end;
				}
			}
		}
		(at == msg.len()).then_some(values)
	}
}

/// A named family of templates sharing framing and slot definitions.
#[derive(Debug, Clone)]
pub struct Grammar {
	pub name: &'static str,
	pub framing: Framing,
	pub templates: Vec<Template>,
	pub slots: Vec<(&'static str, SlotKind)>,
}

impl Grammar {
	pub fn slot(&self, key: &str) -> Option<&SlotKind> {
		self.slots.iter().find(|(k, _)| *k == key).map(|(_, s)| s)
	}
}

/// Names accepted by `tg.send` and `tg.recv`.
pub const BUILTIN_GRAMMARS: &[&str] = &[
	"http_request_keep_alive",
	"http_response_keep_alive",
	"ftp_entering_passive",
	"dns_request",
	"dns_response",
];

pub fn builtin(name: &str) -> Option<Grammar> {
	let g = match name {
		"http_request_keep_alive" => Grammar {
			name: "http_request_keep_alive",
			framing: Framing::Terminator(b"\r\n\r\n"),
			templates: vec![
				Template::parse(
					b"GET /%%URL%% HTTP/1.1\r\nHost: www.example.com\r\nUser-Agent: Mozilla/5.0 (Windows NT 10.0; Win64; x64)\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
				),
				Template::parse(
					b"GET /%%URL%% HTTP/1.1\r\nHost: www.example.com\r\nUser-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0\r\nAccept: text/html,application/xhtml+xml\r\nConnection: keep-alive\r\n\r\n",
				),
			],
			slots: vec![("URL", SlotKind::Ranker { regex: URL_REGEX, msg_len: URL_LEN })],
		},
		"http_response_keep_alive" => Grammar {
			name: "http_response_keep_alive",
			framing: Framing::HttpContentLength,
			templates: vec![Template::parse(
				b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: keep-alive\r\nContent-Length: %%CONTENT-LENGTH%%\r\n\r\n%%HTTP-RESPONSE-BODY%%",
			)],
			slots: vec![
				("CONTENT-LENGTH", SlotKind::ContentLength { of: "HTTP-RESPONSE-BODY" }),
				("HTTP-RESPONSE-BODY", SlotKind::Fte { regex: BODY_REGEX, msg_len: BODY_LEN }),
			],
		},
		"ftp_entering_passive" => Grammar {
			name: "ftp_entering_passive",
			framing: Framing::Line,
			templates: vec![Template::parse(b"227 Entering Passive Mode (127,0,0,1,%%PASV%%).\r\n")],
			slots: vec![("PASV", SlotKind::PasvPort { var: "ftp_pasv_port" })],
		},
		"dns_request" => Grammar {
			name: "dns_request",
			framing: Framing::U16LengthPrefix,
			templates: vec![Template::parse(
				b"%%DNS-LENGTH%%%%DNS-TRANSACTION-ID%%\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00\x3f%%LABEL-1%%\x3f%%LABEL-2%%\x03com\x00\x00\x01\x00\x01",
			)],
			slots: dns_slots(),
		},
		"dns_response" => Grammar {
			name: "dns_response",
			framing: Framing::U16LengthPrefix,
			templates: vec![Template::parse(
				b"%%DNS-LENGTH%%%%DNS-TRANSACTION-ID%%\x81\x80\x00\x01\x00\x01\x00\x00\x00\x00\x3f%%LABEL-1%%\x3f%%LABEL-2%%\x03com\x00\x00\x01\x00\x01\xc0\x0c\x00\x01\x00\x01\x00\x00\x0e\x10\x00\x04\x5d\xb8\xd8\x22",
			)],
			slots: dns_slots(),
		},
		_ => return None,
	};
	Some(g)
}

fn dns_slots() -> Vec<(&'static str, SlotKind)> {
	vec![
		("DNS-LENGTH", SlotKind::DnsLength),
		("DNS-TRANSACTION-ID", SlotKind::DnsTransactionId { var: "dns_transaction_id" }),
		("LABEL-1", SlotKind::Ranker { regex: DNS_LABEL_REGEX, msg_len: DNS_LABEL_LEN }),
		("LABEL-2", SlotKind::Ranker { regex: DNS_LABEL_REGEX, msg_len: DNS_LABEL_LEN }),
	]
}
