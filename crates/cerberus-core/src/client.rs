//! Client session (spec.md §4.4): reads pipelined commands off one client
//! socket, and writes back completed reply groups in the exact order they
//! were submitted, regardless of which backend answered first. Shaped
//! after `neutronium::net::channel::Channel`'s read/write buffer pairing.

use crate::buffer::Buffer;
use crate::command::{parse_command, ClientId, CommandGroup, GroupId, ParsedCommand};
use crate::error::ProxyResult;
use crate::frame;
use cerberus_support::logging::Logger;
use mio::net::TcpStream;
use std::collections::VecDeque;

pub struct ClientSession {
    pub id: ClientId,
    stream: TcpStream,
    recv: Buffer,
    outbound: Buffer,
    /// Groups in flight, oldest (earliest submitted) first. A group is
    /// written to `outbound` and popped only once it, and everything ahead
    /// of it, is complete.
    pending: VecDeque<(GroupId, CommandGroup)>,
    closed: bool,
    /// Set while a backend this client is routed to is over its staged
    /// high-water mark: `readable` becomes a no-op, leaving bytes sitting
    /// in the kernel's receive buffer until the backend drains.
    paused: bool,
    /// Set while this client's own outbound buffer is over its high-water
    /// mark: a slow client that can't keep up with its replies stops having
    /// its requests read at all, rather than growing `outbound` unbounded.
    self_paused: bool,
    write_high_water: usize,
    log: Logger,
}

impl ClientSession {
    pub fn new(id: ClientId, stream: TcpStream, read_cap: usize, write_cap: usize, log: &Logger) -> ClientSession {
        ClientSession {
            id,
            stream,
            recv: Buffer::with_capacity(read_cap),
            outbound: Buffer::with_capacity(write_cap),
            pending: VecDeque::new(),
            closed: false,
            paused: false,
            self_paused: false,
            write_high_water: write_cap,
            log: log.clone(),
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Reads whatever bytes are available and splits off every complete
    /// top-level frame, returning each as `(raw bytes, decoded args)` for
    /// the caller to route. Partial trailing bytes stay buffered.
    pub fn readable(&mut self) -> ProxyResult<Vec<ParsedCommand>> {
        if self.paused || self.self_paused {
            return Ok(Vec::new());
        }

        self.recv.ingress(&mut self.stream)?;

        let result = frame::split(self.recv.read_slice()).map_err(|_| crate::error::ProxyError::protocol())?;

        let mut commands = Vec::with_capacity(result.frames.len());
        for range in &result.frames {
            let (raw, args) = parse_command(self.recv.read_slice(), range.clone())
                .map_err(|_| crate::error::ProxyError::protocol())?;
            commands.push((raw, args));
        }
        self.recv.advance(result.interrupt_point);

        Ok(commands)
    }

    pub fn enqueue_group(&mut self, group_id: GroupId, group: CommandGroup) {
        self.pending.push_back((group_id, group));
    }

    pub fn pending_group_count(&self) -> usize {
        self.pending.len()
    }

    /// Records a response against whichever in-flight group owns it. The
    /// group need not be at the front: later groups can complete before
    /// earlier ones if they land on a faster backend.
    pub fn record_response(&mut self, group_id: GroupId, index_in_group: usize, response: Vec<u8>) {
        if let Some((_, group)) = self.pending.iter_mut().find(|(id, _)| *id == group_id) {
            group.record_response(index_in_group, response);
        }
    }

    /// Moves every complete group, starting from the front, into the
    /// outbound buffer. Stops at the first incomplete group so replies
    /// reach the client in submission order. Pauses reads from this client
    /// once the outbound backlog crosses the high-water mark: a client slow
    /// to drain its replies shouldn't be allowed to keep piling up more.
    pub fn flush_ready_groups(&mut self) {
        let mut scratch = Vec::new();
        while let Some((_, group)) = self.pending.front() {
            if !group.is_complete() {
                break;
            }
            let (_, group) = self.pending.pop_front().unwrap();
            scratch.clear();
            group.write_into(&mut scratch);
            self.outbound.extend_from_slice(&scratch);
        }

        if self.outbound.len() > self.write_high_water {
            self.self_paused = true;
        }
    }

    pub fn writable(&mut self) -> ProxyResult<()> {
        self.outbound.egress(&mut self.stream)?;

        if self.outbound.len() <= self.write_high_water {
            self.self_paused = false;
        }

        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// A session is ready to be torn down once its socket is closed (or
    /// fatally errored) and no unflushed reply is left to deliver.
    pub fn should_reap(&self) -> bool {
        self.closed && self.pending.is_empty() && !self.has_pending_writes()
    }

    /// Drops every unanswered group and anything queued to be written.
    /// Used once a client socket is known gone: nothing is listening for
    /// these replies any more, so there's no point tracking completion.
    pub fn abandon_pending(&mut self) {
        self.pending.clear();
        self.outbound.clear();
    }

    #[cfg(test)]
    fn outbound_bytes(&self) -> &[u8] {
        self.outbound.read_slice()
    }

    #[cfg(test)]
    fn is_self_paused(&self) -> bool {
        self.self_paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

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
    fn groups_flush_in_submission_order_regardless_of_completion_order() {
        use cerberus_support::logging;
        use std::net::TcpListener as StdListener;

        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_std = std::net::TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server_std);
        drop(client_std);

        let log = logging::discard();
        let mut session = ClientSession::new(0, stream, 4096, 4096, &log);

        let buf = encode(&[b"GET", b"x"]);
        let (raw, args) = parse_command(&buf, 0..buf.len()).unwrap();
        let cmd_a = Command::new(raw, &args, 0, 0, 0);
        let cmd_b = Command::new(encode(&[b"GET", b"y"]), &args, 0, 1, 0);

        session.enqueue_group(0, CommandGroup::new(vec![cmd_a]));
        session.enqueue_group(1, CommandGroup::new(vec![cmd_b]));

        // The second group answers first; nothing should flush yet.
        session.record_response(1, 0, b"$1\r\nb\r\n".to_vec());
        session.flush_ready_groups();
        assert!(!session.has_pending_writes());

        session.record_response(0, 0, b"$1\r\na\r\n".to_vec());
        session.flush_ready_groups();
        assert!(session.has_pending_writes());
        assert_eq!(session.pending_group_count(), 0);
        assert_eq!(session.outbound_bytes(), b"$1\r\na\r\n$1\r\nb\r\n");
    }

    #[test]
    fn reads_pause_once_outbound_backlog_crosses_high_water_and_resume_after_drain() {
        use cerberus_support::logging;
        use std::net::TcpListener as StdListener;

        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_std = std::net::TcpStream::connect(addr).unwrap();
        let (server_std, _) = listener.accept().unwrap();
        server_std.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server_std);

        let log = logging::discard();
        // A tiny write high-water (the read cap is irrelevant here) so a
        // single short reply already crosses it.
        let mut session = ClientSession::new(0, stream, 4096, 1, &log);

        let buf = encode(&[b"GET", b"x"]);
        let (raw, args) = parse_command(&buf, 0..buf.len()).unwrap();
        let cmd = Command::new(raw, &args, 0, 0, 0);
        session.enqueue_group(0, CommandGroup::new(vec![cmd]));

        session.record_response(0, 0, b"$1\r\na\r\n".to_vec());
        session.flush_ready_groups();
        assert!(session.is_self_paused());
        assert!(session.readable().unwrap().is_empty());

        session.writable().unwrap();
        assert!(!session.is_self_paused());

        drop(client_std);
    }
}
