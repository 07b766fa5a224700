//! Slot Map Updater (spec.md §4.6, §6): a one-shot connection that fetches
//! `CLUSTER NODES` from a backend and parses the reply into a slot map.
//! Parsing logic corresponds to `original_source/core/slot_map.hpp`'s
//! `parse_slot_map`, for which only the declaration survived distillation.

use crate::addr::Address;
use crate::buffer::Buffer;
use crate::error::{FaultKind, ProxyError, ProxyResult};
use crate::frame::{self, Visitor};
use mio::net::TcpStream;
use std::collections::BTreeMap;
use std::io::Write;

const REQUEST: &[u8] = b"*2\r\n$7\r\nCLUSTER\r\n$5\r\nNODES\r\n";

enum State {
    Connecting,
    AwaitingReply,
    Done,
}

/// A transient connection that lives only for one topology fetch.
pub struct SlotMapUpdater {
    pub target: Address,
    stream: TcpStream,
    state: State,
    recv: Buffer,
    request_sent: usize,
}

impl SlotMapUpdater {
    pub fn connect(target: Address) -> std::io::Result<SlotMapUpdater> {
        let sock_addr = target.to_socket_addr()?;
        let stream = TcpStream::connect(sock_addr)?;

        Ok(SlotMapUpdater {
            target,
            stream,
            state: State::Connecting,
            recv: Buffer::new(),
            request_sent: 0,
        })
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Drive the updater on a writable readiness event: send the request.
    pub fn writable(&mut self) -> ProxyResult<()> {
        if !matches!(self.state, State::Connecting) {
            return Ok(());
        }

        while self.request_sent < REQUEST.len() {
            match self.stream.write(&REQUEST[self.request_sent..]) {
                Ok(0) => return Err(ProxyError::Fatal(FaultKind::PeerClosed)),
                Ok(n) => self.request_sent += n,
                Err(err) => return Err(err.into()),
            }
        }

        self.state = State::AwaitingReply;
        Ok(())
    }

    /// Drive the updater on a readable readiness event. Returns the parsed
    /// slot map once a complete reply has arrived.
    pub fn readable(&mut self) -> ProxyResult<Option<BTreeMap<u16, Address>>> {
        if !matches!(self.state, State::AwaitingReply) {
            return Ok(None);
        }

        self.recv.ingress(&mut self.stream)?;

        let result = frame::split(self.recv.read_slice()).map_err(|_| ProxyError::protocol())?;
        let Some(range) = result.frames.first().cloned() else {
            return Ok(None);
        };

        let mut visitor = BulkStringVisitor::default();
        frame::parse(self.recv.read_slice(), range, &mut visitor)?;

        let body = visitor.body.ok_or_else(ProxyError::protocol)?;
        let body = std::str::from_utf8(&body).map_err(|_| ProxyError::protocol())?;

        self.state = State::Done;
        Ok(Some(parse_cluster_nodes(body)))
    }
}

#[derive(Default)]
struct BulkStringVisitor {
    body: Option<Vec<u8>>,
}

impl Visitor for BulkStringVisitor {
    fn on_integer(&mut self, _value: i64) {}
    fn on_simple_string(&mut self, _bytes: &[u8]) {}
    fn on_bulk_string(&mut self, bytes: &[u8]) {
        self.body = Some(bytes.to_vec());
    }
    fn on_error(&mut self, _bytes: &[u8]) {}
    fn on_array(&mut self, _len: usize) {}
    fn on_nil(&mut self) {}
}

/// Parses a `CLUSTER NODES` reply body into `slot -> Address`, keyed by
/// range upper bound. Each line is `id ip:port[@cport] flags master-id
/// ping-sent pong-recv config-epoch link-state [slot descriptors]`; a node
/// is usable only if its flags contain `master` and not `fail`. Consecutive
/// slots owned by the same address coalesce into a single map entry at
/// `highest_owned_slot + 1`.
fn parse_cluster_nodes(body: &str) -> BTreeMap<u16, Address> {
    const HEADER_FIELDS: usize = 8;
    let mut owners: Vec<(u16, Address)> = Vec::new();

    for line in body.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < HEADER_FIELDS {
            continue;
        }

        let flags: Vec<&str> = fields[2].split(',').collect();
        let usable = flags.contains(&"master") && !flags.contains(&"fail");
        if !usable {
            continue;
        }

        let host_port = fields[1].split('@').next().unwrap();
        let addr: Address = match host_port.parse() {
            Ok(a) => a,
            Err(_) => continue,
        };

        for field in &fields[HEADER_FIELDS..] {
            if field.starts_with('[') {
                continue;
            }
            if let Some((start, end)) = parse_slot_descriptor(field) {
                for slot in start..=end {
                    owners.push((slot, addr.clone()));
                }
            }
        }
    }

    owners.sort_by_key(|(slot, _)| *slot);

    let mut map = BTreeMap::new();
    let mut iter = owners.into_iter().peekable();

    while let Some((slot, addr)) = iter.next() {
        let mut last = slot;
        while let Some((next_slot, next_addr)) = iter.peek() {
            if *next_slot == last + 1 && *next_addr == addr {
                last = *next_slot;
                iter.next();
            } else {
                break;
            }
        }
        map.insert(last + 1, addr);
    }

    map
}

fn parse_slot_descriptor(field: &str) -> Option<(u16, u16)> {
    match field.split_once('-') {
        Some((a, b)) => Some((a.parse().ok()?, b.parse().ok()?)),
        None => {
            let n: u16 = field.parse().ok()?;
            Some((n, n))
        }
    }
}
