//! Backend session (spec.md §4.5): one per backend address, accepting
//! routed commands from many clients, writing them in arrival order, and
//! zipping replies back to their originating command strictly in FIFO
//! order. Grounded on `neutronium::net::channel::Channel`'s
//! buffer-in/buffer-out shape, adapted from its binary framing to the
//! wire protocol of spec.md §4.1.

use crate::addr::Address;
use crate::buffer::Buffer;
use crate::command::{ClientId, GroupId, Redirect, Route};
use crate::error::{ProxyError, ProxyResult};
use crate::frame;
use cerberus_support::logging::{self, Logger};
use mio::net::TcpStream;
use std::collections::VecDeque;

const ASKING: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// One command staged to be written on this backend's wire.
pub struct QueuedCommand {
    pub client: ClientId,
    pub group: GroupId,
    pub index_in_group: usize,
    pub raw: Vec<u8>,
    pub route: Route,
    /// If set, an `ASKING` command is written immediately before this one
    /// and its `+OK` reply is swallowed rather than delivered anywhere.
    pub asking: bool,
}

/// What a reply, once parsed off the wire, means for the rest of the
/// system.
pub enum ReplyEvent {
    Delivered {
        client: ClientId,
        group: GroupId,
        index_in_group: usize,
        data: Vec<u8>,
    },
    Redirected {
        client: ClientId,
        group: GroupId,
        index_in_group: usize,
        raw: Vec<u8>,
        to: Redirect,
    },
}

/// A command that has been written to the wire and is awaiting its reply.
enum Inflight {
    Real {
        client: ClientId,
        group: GroupId,
        index_in_group: usize,
        raw: Vec<u8>,
        route: Route,
    },
    /// The synthetic `ASKING` preamble sent ahead of an ASK retry: its
    /// `+OK` reply is read and discarded.
    AskingPreamble,
    /// A command whose owning client has gone away. Still awaited on the
    /// wire to keep the FIFO aligned, but the reply is dropped.
    Purged,
}

pub struct BackendSession {
    pub addr: Address,
    stream: TcpStream,
    outbound: Buffer,
    recv: Buffer,
    staged: VecDeque<QueuedCommand>,
    inflight: VecDeque<Inflight>,
    log: Logger,
}

impl BackendSession {
    pub fn connect(addr: Address, read_cap: usize, write_cap: usize, log: &Logger) -> std::io::Result<BackendSession> {
        let sock_addr = addr.to_socket_addr()?;
        let stream = TcpStream::connect(sock_addr)?;

        Ok(BackendSession {
            addr: addr.clone(),
            stream,
            outbound: Buffer::with_capacity(write_cap),
            recv: Buffer::with_capacity(read_cap),
            staged: VecDeque::new(),
            inflight: VecDeque::new(),
            log: log.new(logging::o!("backend" => addr.to_string())),
        })
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty() || !self.staged.is_empty()
    }

    pub fn stage(&mut self, cmd: QueuedCommand) {
        self.staged.push_back(cmd);
    }

    /// Removes a client's commands by identity: staged (never seen by the
    /// backend) commands are dropped outright; inflight commands are
    /// marked `Purged` in place so the per-connection reply FIFO stays
    /// aligned, but nothing is forwarded once their reply arrives.
    pub fn purge_client(&mut self, client: ClientId) {
        self.staged.retain(|cmd| cmd.client != client);

        for entry in self.inflight.iter_mut() {
            if let Inflight::Real { client: c, .. } = entry {
                if *c == client {
                    *entry = Inflight::Purged;
                }
            }
        }
    }

    /// Moves staged commands onto the outbound buffer and flushes to the
    /// wire, one at a time, stopping as soon as a write doesn't fully
    /// drain: a slow backend then leaves a real backlog in `staged` rather
    /// than an unbounded one in the socket buffer, which is what
    /// `staged_len` needs to reflect for backpressure to mean anything.
    pub fn writable(&mut self) -> ProxyResult<()> {
        self.outbound.egress(&mut self.stream)?;

        while self.outbound.is_empty() && !self.staged.is_empty() {
            let cmd = self.staged.pop_front().expect("checked non-empty");

            if cmd.asking {
                self.outbound.extend_from_slice(ASKING);
                self.inflight.push_back(Inflight::AskingPreamble);
            }
            self.outbound.extend_from_slice(&cmd.raw);
            self.inflight.push_back(Inflight::Real {
                client: cmd.client,
                group: cmd.group,
                index_in_group: cmd.index_in_group,
                raw: cmd.raw,
                route: cmd.route,
            });

            match self.outbound.egress(&mut self.stream) {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(ProxyError::from(err)),
            }
        }

        Ok(())
    }

    /// Reads and parses whatever complete replies are available, zipping
    /// each one with the head of the inflight FIFO.
    pub fn readable(&mut self) -> ProxyResult<Vec<ReplyEvent>> {
        self.recv.ingress(&mut self.stream)?;

        let result = frame::split(self.recv.read_slice()).map_err(|_| ProxyError::protocol())?;

        let mut events = Vec::with_capacity(result.frames.len());
        for range in &result.frames {
            let data = self.recv.read_slice()[range.clone()].to_vec();
            self.dispatch_reply(data, &mut events);
        }
        self.recv.advance(result.interrupt_point);

        Ok(events)
    }

    fn dispatch_reply(&mut self, data: Vec<u8>, events: &mut Vec<ReplyEvent>) {
        let entry = match self.inflight.pop_front() {
            Some(entry) => entry,
            None => {
                logging::warn!(self.log, "reply with no matching inflight command; dropping");
                return;
            }
        };

        match entry {
            Inflight::Purged | Inflight::AskingPreamble => {}
            Inflight::Real {
                client,
                group,
                index_in_group,
                raw,
                route: _,
            } => {
                if let Some(to) = redirect_target(&data) {
                    events.push(ReplyEvent::Redirected {
                        client,
                        group,
                        index_in_group,
                        raw,
                        to,
                    });
                } else {
                    events.push(ReplyEvent::Delivered {
                        client,
                        group,
                        index_in_group,
                        data,
                    });
                }
            }
        }
    }

    /// On socket failure with inflight work outstanding, every inflight
    /// `Real` command is handed back to the caller to retry elsewhere.
    pub fn drain_for_retry(&mut self) -> Vec<(ClientId, GroupId, usize, Vec<u8>, Route)> {
        let staged = self.staged.drain(..).map(|c| (c.client, c.group, c.index_in_group, c.raw, c.route));
        let inflight = self.inflight.drain(..).filter_map(|entry| match entry {
            Inflight::Real {
                client,
                group,
                index_in_group,
                raw,
                route,
            } => Some((client, group, index_in_group, raw, route)),
            _ => None,
        });

        staged.chain(inflight).collect()
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Sniffs whether a reply is a `MOVED`/`ASK` redirection without a full
/// parse: both are `Error` frames whose text starts with the keyword.
fn redirect_target(reply: &[u8]) -> Option<Redirect> {
    if reply.first() != Some(&b'-') {
        return None;
    }

    let text = std::str::from_utf8(&reply[1..reply.len().saturating_sub(2)]).ok()?;

    if let Some(rest) = text.strip_prefix("MOVED ") {
        parse_redirect_target(rest).map(Redirect::Moved)
    } else if let Some(rest) = text.strip_prefix("ASK ") {
        parse_redirect_target(rest).map(Redirect::Ask)
    } else {
        None
    }
}

fn parse_redirect_target(rest: &str) -> Option<Address> {
    let host_port = rest.split_whitespace().nth(1)?;
    host_port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_target_parses_moved() {
        let target = redirect_target(b"-MOVED 5000 127.0.0.1:7001\r\n").unwrap();
        assert!(matches!(target, Redirect::Moved(addr) if addr == Address::new("127.0.0.1", 7001)));
    }

    #[test]
    fn redirect_target_parses_ask() {
        let target = redirect_target(b"-ASK 5000 127.0.0.1:7001\r\n").unwrap();
        assert!(matches!(target, Redirect::Ask(addr) if addr == Address::new("127.0.0.1", 7001)));
    }

    #[test]
    fn redirect_target_ignores_other_errors() {
        assert!(redirect_target(b"-ERR wrong number of arguments\r\n").is_none());
    }

    #[test]
    fn redirect_target_ignores_non_errors() {
        assert!(redirect_target(b"+OK\r\n").is_none());
    }
}
