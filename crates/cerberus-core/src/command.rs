//! The routing unit (`Command`) and the reply-ordering unit
//! (`CommandGroup`), per spec.md §3. Back-references use plain integer
//! ids rather than owning pointers, per the strategy in spec.md §9 — the
//! same approach `neutronium::net::endpoint::Endpoint` takes with
//! `ChannelId = usize`.

use crate::addr::Address;
use crate::frame::{self, ProtocolError, Visitor};
use crate::slot::key_slot;
use std::ops::Range;

pub type ClientId = usize;
pub type BackendId = usize;
pub type GroupId = u64;

/// A decoded command: the verbatim frame bytes plus its bulk-string
/// arguments (e.g. `["GET", "x"]`).
pub type ParsedCommand = (Vec<u8>, Vec<Vec<u8>>);

/// Where a command's routing points: a specific slot, or "no key" (e.g.
/// `PING`), which is handed to any backend covered by the slot map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Route {
    Slot(u16),
    NoKey,
}

/// One client request plus the metadata needed to route it and hand the
/// response back to the right place.
pub struct Command {
    /// The verbatim encoded frame, forwarded to the backend byte for byte.
    pub raw: Vec<u8>,
    pub route: Route,
    pub client: ClientId,
    pub group: GroupId,
    pub index_in_group: usize,
    pub response: Option<Vec<u8>>,
}

impl Command {
    pub fn new(raw: Vec<u8>, args: &[Vec<u8>], client: ClientId, group: GroupId, index_in_group: usize) -> Command {
        let route = match args.get(1) {
            Some(key) => Route::Slot(key_slot(key)),
            None => Route::NoKey,
        };

        Command {
            raw,
            route,
            client,
            group,
            index_in_group,
            response: None,
        }
    }
}

/// Parses a single top-level frame (already known complete, per
/// `frame::split`) as an `Array` of `BulkString`s and returns the
/// verbatim bytes plus the decoded arguments.
pub fn parse_command(buf: &[u8], range: Range<usize>) -> Result<ParsedCommand, ProtocolError> {
    let mut visitor = CommandVisitor::default();
    frame::parse(buf, range.clone(), &mut visitor)?;

    if visitor.malformed || visitor.top_level_array.is_none() {
        return Err(ProtocolError);
    }

    Ok((buf[range].to_vec(), visitor.args))
}

#[derive(Default)]
struct CommandVisitor {
    args: Vec<Vec<u8>>,
    top_level_array: Option<usize>,
    malformed: bool,
}

impl Visitor for CommandVisitor {
    fn on_integer(&mut self, _value: i64) {
        self.malformed = true;
    }
    fn on_simple_string(&mut self, _bytes: &[u8]) {
        self.malformed = true;
    }
    fn on_bulk_string(&mut self, bytes: &[u8]) {
        self.args.push(bytes.to_vec());
    }
    fn on_error(&mut self, _bytes: &[u8]) {
        self.malformed = true;
    }
    fn on_array(&mut self, len: usize) {
        if self.top_level_array.is_some() {
            self.malformed = true;
        } else {
            self.top_level_array = Some(len);
        }
    }
    fn on_nil(&mut self) {
        self.malformed = true;
    }
}

/// The commands parsed from a single client read event, preserved as the
/// unit replies are written back in.
pub struct CommandGroup {
    pub commands: Vec<Command>,
    unanswered: usize,
}

impl CommandGroup {
    pub fn new(commands: Vec<Command>) -> CommandGroup {
        let unanswered = commands.len();
        CommandGroup { commands, unanswered }
    }

    pub fn is_complete(&self) -> bool {
        self.unanswered == 0
    }

    pub fn record_response(&mut self, index_in_group: usize, response: Vec<u8>) {
        let cmd = &mut self.commands[index_in_group];
        debug_assert!(cmd.response.is_none(), "response already recorded for this command");
        cmd.response = Some(response);
        self.unanswered -= 1;
    }

    /// Total encoded length of every command's recorded response, valid
    /// only once `is_complete()`.
    pub fn reply_len(&self) -> usize {
        self.commands
            .iter()
            .map(|c| c.response.as_ref().map_or(0, Vec::len))
            .sum()
    }

    pub fn write_into(&self, out: &mut Vec<u8>) {
        for cmd in &self.commands {
            out.extend_from_slice(cmd.response.as_deref().expect("group must be complete"));
        }
    }
}

/// An address a redirected command should retry against, plus whether it
/// was a `MOVED` (permanent, triggers a slot-map refresh) or `ASK`
/// (one-shot) redirection.
#[derive(Debug, Clone)]
pub enum Redirect {
    Moved(Address),
    Ask(Address),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::split;

    fn encode(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for p in parts {
            out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
            out.extend_from_slice(p);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn parses_get_into_slot_route() {
        let buf = encode(&[b"GET", b"x"]);
        let range = split(&buf).unwrap().frames[0].clone();
        let (raw, args) = parse_command(&buf, range).unwrap();
        assert_eq!(raw, buf);

        let cmd = Command::new(raw, &args, 0, 0, 0);
        assert!(matches!(cmd.route, Route::Slot(_)));
    }

    #[test]
    fn parses_ping_as_no_key() {
        let buf = encode(&[b"PING"]);
        let range = split(&buf).unwrap().frames[0].clone();
        let (raw, args) = parse_command(&buf, range).unwrap();
        let cmd = Command::new(raw, &args, 0, 0, 0);
        assert_eq!(cmd.route, Route::NoKey);
    }

    #[test]
    fn rejects_non_array_top_level() {
        let buf = b"+OK\r\n".to_vec();
        let range = split(&buf).unwrap().frames[0].clone();
        assert!(parse_command(&buf, range).is_err());
    }

    #[test]
    fn group_completes_only_when_every_command_has_a_response() {
        let buf = encode(&[b"GET", b"x"]);
        let range = split(&buf).unwrap().frames[0].clone();
        let (raw, args) = parse_command(&buf, range).unwrap();

        let mut group = CommandGroup::new(vec![
            Command::new(raw.clone(), &args, 0, 0, 0),
            Command::new(raw, &args, 0, 0, 1),
        ]);

        assert!(!group.is_complete());
        group.record_response(1, b"$1\r\n2\r\n".to_vec());
        assert!(!group.is_complete());
        group.record_response(0, b"$1\r\n1\r\n".to_vec());
        assert!(group.is_complete());

        let mut out = Vec::new();
        group.write_into(&mut out);
        assert_eq!(out, b"$1\r\n1\r\n$1\r\n2\r\n");
    }
}
