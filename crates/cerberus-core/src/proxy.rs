//! The reactor (spec.md §4.6): a single-threaded, non-blocking event loop
//! that owns every socket the proxy touches, using `mio` the same way
//! `neutronium::net::endpoint::Endpoint` drives its connections, but keyed
//! to cluster routing instead of a game server's binary protocol.

use crate::addr::Address;
use crate::backend::{BackendSession, QueuedCommand, ReplyEvent};
use crate::client::ClientSession;
use crate::command::{BackendId, ClientId, Command, CommandGroup, GroupId, ParsedCommand, Redirect, Route};
use crate::connection::Connection;
use crate::error::{ProxyError, ProxyResult};
use crate::slotmap::SlotMap;
use crate::updater::SlotMapUpdater;
use cerberus_support::logging::{self, Logger};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::VecDeque;
use std::time::Duration;

/// Process-wide knobs, populated from the command line (spec.md §4.9).
pub struct Config {
    pub listen: Address,
    pub seed: Address,
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,
    pub staged_high_water: usize,
}

enum Outcome {
    Keep,
    Reap,
}

/// Where a retried command should go: re-resolved through the slot map, or
/// pinned to a redirect target handed back by a `MOVED`/`ASK` reply.
enum RetryTarget {
    Route(Route),
    Forced(Address, bool),
}

struct RetryItem {
    client: ClientId,
    group: GroupId,
    index_in_group: usize,
    raw: Vec<u8>,
    target: RetryTarget,
}

/// A reply queued to be written through `deliver` once the current dispatch
/// pass finishes and every connection has been put back in the slab. Needed
/// because `stage_command` can run reentrantly from `route_new_group`, while
/// the client's own slot is still taken out of `connections` — a `deliver`
/// issued right there would silently find nothing to write to.
struct PendingDelivery {
    client: ClientId,
    group: GroupId,
    index_in_group: usize,
    data: Vec<u8>,
}

const BOTH: Interest = Interest::READABLE.add(Interest::WRITABLE);

const CLUSTERDOWN_REPLY: &[u8] = b"-CLUSTERDOWN The cluster is down\r\n";

pub struct Proxy {
    poll: Poll,
    events: Events,
    connections: Vec<Option<Connection>>,
    free: Vec<usize>,
    listener_token: Token,
    slots: SlotMap<BackendId>,
    next_group_id: GroupId,
    retry_queue: VecDeque<RetryItem>,
    pending_deliveries: VecDeque<PendingDelivery>,
    refreshing: bool,
    /// Clients currently paused because some backend they depend on is
    /// over its staged high-water mark.
    paused_clients: std::collections::HashSet<ClientId>,
    config: Config,
    log: Logger,
}

impl Proxy {
    pub fn new(config: Config, log: Logger) -> ProxyResult<Proxy> {
        let sock_addr = config.listen.to_socket_addr()?;
        let mut listener = TcpListener::bind(sock_addr)?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, Token(0), Interest::READABLE)?;

        let mut proxy = Proxy {
            poll,
            events: Events::with_capacity(1024),
            connections: Vec::new(),
            free: Vec::new(),
            listener_token: Token(0),
            slots: SlotMap::new(),
            next_group_id: 0,
            retry_queue: VecDeque::new(),
            pending_deliveries: VecDeque::new(),
            refreshing: false,
            paused_clients: std::collections::HashSet::new(),
            config,
            log,
        };
        proxy.connections.push(Some(Connection::Listener(listener)));

        logging::info!(proxy.log, "listening"; "addr" => proxy.config.listen.to_string());
        proxy.trigger_refresh()?;
        Ok(proxy)
    }

    /// One iteration of the loop: block on `poll` (optionally bounded by
    /// `timeout`), dispatch every ready socket, then sweep retries and
    /// deferred deliveries. `main.rs` drives this in a loop bounded by its
    /// own SIGTERM check rather than looping here, so tests can step it.
    pub fn tick(&mut self, timeout: Option<Duration>) -> ProxyResult<()> {
        self.poll.poll(&mut self.events, timeout)?;

        let batch: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_read_closed() || e.is_error()))
            .collect();

        for (token, readable, writable, closed) in batch {
            self.dispatch(token, readable, writable, closed)?;
        }

        self.process_retry_queue()?;
        self.process_pending_deliveries()?;
        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool, closed: bool) -> ProxyResult<()> {
        let idx = token.0;

        if idx == self.listener_token.0 {
            if readable {
                self.accept_all()?;
            }
            return Ok(());
        }

        let mut conn = match self.connections.get_mut(idx).and_then(Option::take) {
            Some(c) => c,
            None => return Ok(()),
        };

        let outcome = match &mut conn {
            Connection::Listener(_) => unreachable!("listener dispatched through the generic slot path"),
            Connection::Client(_) => self.drive_client(idx, &mut conn, readable, writable, closed)?,
            Connection::Backend(_) => self.drive_backend(&mut conn, readable, writable, closed)?,
            Connection::Updater(_) => self.drive_updater(&mut conn, readable, writable)?,
        };

        match outcome {
            Outcome::Reap => {
                if matches!(conn, Connection::Client(_)) {
                    self.purge_client_from_backends(idx);
                }
                let _ = self.deregister(&mut conn);
            }
            Outcome::Keep => {
                self.connections[idx] = Some(conn);
                return Ok(());
            }
        }

        self.free.push(idx);
        Ok(())
    }

    fn accept_all(&mut self) -> ProxyResult<()> {
        loop {
            let (stream, peer) = match self.listener_accept() {
                Ok(pair) => pair,
                Err(ProxyError::Wait) => return Ok(()),
                Err(err) => return Err(err),
            };

            let idx = self.reserve_slot();
            let client = ClientSession::new(
                idx,
                stream,
                self.config.read_buffer_bytes,
                self.config.write_buffer_bytes,
                &self.log,
            );
            self.connections[idx] = Some(Connection::Client(client));
            self.register(idx, BOTH)?;
            logging::debug!(self.log, "accepted client"; "peer" => peer.to_string(), "client_id" => idx);
        }
    }

    fn listener_accept(&mut self) -> ProxyResult<(mio::net::TcpStream, std::net::SocketAddr)> {
        match self.connections[self.listener_token.0].as_mut() {
            Some(Connection::Listener(listener)) => listener.accept().map_err(ProxyError::from),
            _ => unreachable!("listener slot corrupted"),
        }
    }

    fn drive_client(
        &mut self,
        idx: usize,
        conn: &mut Connection,
        readable: bool,
        writable: bool,
        closed: bool,
    ) -> ProxyResult<Outcome> {
        let client = match conn {
            Connection::Client(c) => c,
            _ => unreachable!(),
        };

        if closed {
            client.mark_closed();
            client.abandon_pending();
        }

        if readable && !closed {
            match client.readable() {
                Ok(commands) => {
                    if !commands.is_empty() {
                        self.route_new_group(idx, client, commands)?;
                    }
                }
                Err(ProxyError::Wait) => {}
                Err(ProxyError::Fatal(_)) => {
                    client.mark_closed();
                    client.abandon_pending();
                }
            }
        }

        if writable {
            match client.writable() {
                Ok(()) => {}
                Err(ProxyError::Wait) => {}
                Err(ProxyError::Fatal(_)) => {
                    client.mark_closed();
                    client.abandon_pending();
                }
            }
        }

        if client.should_reap() {
            Ok(Outcome::Reap)
        } else {
            Ok(Outcome::Keep)
        }
    }

    fn route_new_group(
        &mut self,
        client_idx: ClientId,
        client: &mut ClientSession,
        commands: Vec<ParsedCommand>,
    ) -> ProxyResult<()> {
        let group_id = self.next_group_id;
        self.next_group_id += 1;

        let mut cmds = Vec::with_capacity(commands.len());
        for (index, (raw, args)) in commands.into_iter().enumerate() {
            cmds.push(Command::new(raw, &args, client_idx, group_id, index));
        }

        for cmd in &cmds {
            self.stage_command(
                cmd.client,
                cmd.group,
                cmd.index_in_group,
                cmd.raw.clone(),
                RetryTarget::Route(cmd.route),
            )?;
        }

        client.enqueue_group(group_id, CommandGroup::new(cmds));
        Ok(())
    }

    fn drive_backend(
        &mut self,
        conn: &mut Connection,
        readable: bool,
        writable: bool,
        closed: bool,
    ) -> ProxyResult<Outcome> {
        let backend = match conn {
            Connection::Backend(b) => b,
            _ => unreachable!(),
        };

        if closed {
            self.fail_backend(backend)?;
            return Ok(Outcome::Reap);
        }

        if writable {
            match backend.writable() {
                Ok(()) => {
                    if backend.staged_len() < self.config.staged_high_water {
                        self.resume_paused_clients();
                    }
                }
                Err(ProxyError::Wait) => {}
                Err(ProxyError::Fatal(_)) => {
                    self.fail_backend(backend)?;
                    return Ok(Outcome::Reap);
                }
            }
        }

        if readable {
            match backend.readable() {
                Ok(events) => {
                    for ev in events {
                        self.handle_reply_event(ev)?;
                    }
                }
                Err(ProxyError::Wait) => {}
                Err(ProxyError::Fatal(_)) => {
                    self.fail_backend(backend)?;
                    return Ok(Outcome::Reap);
                }
            }
        }

        Ok(Outcome::Keep)
    }

    /// Resumes every paused client. A client paused on behalf of one
    /// overloaded backend is released once *any* backend drains below its
    /// watermark: a slightly generous approximation, but the client's
    /// other in-flight commands (if any) will re-pause it immediately if
    /// its real bottleneck hasn't actually cleared.
    fn resume_paused_clients(&mut self) {
        for client in self.paused_clients.drain() {
            if let Some(Connection::Client(session)) = self.connections.get_mut(client).and_then(Option::as_mut) {
                session.resume();
            }
        }
    }

    /// Strips a departing client's commands out of every backend's staged
    /// and inflight queues, so a reply that arrives after the client's slot
    /// has been reused doesn't get delivered to whatever took its place.
    fn purge_client_from_backends(&mut self, client: ClientId) {
        for slot in self.connections.iter_mut().flatten() {
            if let Connection::Backend(backend) = slot {
                backend.purge_client(client);
            }
        }
    }

    /// A dead backend socket (protocol error or a fatal I/O error) may mean
    /// the real cluster has failed this node over to a different address;
    /// in addition to closing the connection and requeueing its inflight
    /// work, a refresh is scheduled so the retried commands resolve against
    /// current topology rather than reconnecting to the same dead address
    /// forever.
    fn fail_backend(&mut self, backend: &mut BackendSession) -> ProxyResult<()> {
        logging::warn!(self.log, "backend connection lost"; "addr" => backend.addr.to_string());
        self.slots.erase(&backend.addr);

        for (client, group, index_in_group, raw, route) in backend.drain_for_retry() {
            self.retry_queue.push_back(RetryItem {
                client,
                group,
                index_in_group,
                raw,
                target: RetryTarget::Route(route),
            });
        }

        self.trigger_refresh()
    }

    fn handle_reply_event(&mut self, event: ReplyEvent) -> ProxyResult<()> {
        match event {
            ReplyEvent::Delivered {
                client,
                group,
                index_in_group,
                data,
            } => self.deliver(client, group, index_in_group, data),
            ReplyEvent::Redirected {
                client,
                group,
                index_in_group,
                raw,
                to,
            } => {
                match to {
                    Redirect::Moved(addr) => {
                        self.retry_queue.push_back(RetryItem {
                            client,
                            group,
                            index_in_group,
                            raw,
                            target: RetryTarget::Forced(addr, false),
                        });
                        self.trigger_refresh()?;
                    }
                    Redirect::Ask(addr) => {
                        self.retry_queue.push_back(RetryItem {
                            client,
                            group,
                            index_in_group,
                            raw,
                            target: RetryTarget::Forced(addr, true),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    fn deliver(&mut self, client: ClientId, group: GroupId, index_in_group: usize, data: Vec<u8>) -> ProxyResult<()> {
        if let Some(Connection::Client(session)) = self.connections.get_mut(client).and_then(Option::as_mut) {
            session.record_response(group, index_in_group, data);
            session.flush_ready_groups();

            // `writable` on this socket is edge-triggered and almost certainly
            // already fired once, back when the client connected with nothing
            // queued to write. Flush here instead of waiting for a write
            // readiness edge that isn't coming.
            match session.writable() {
                Ok(()) | Err(ProxyError::Wait) => {}
                Err(ProxyError::Fatal(_)) => {
                    session.mark_closed();
                    session.abandon_pending();
                }
            }
        }
        Ok(())
    }

    fn drive_updater(&mut self, conn: &mut Connection, readable: bool, writable: bool) -> ProxyResult<Outcome> {
        let updater = match conn {
            Connection::Updater(u) => u,
            _ => unreachable!(),
        };

        if writable {
            if let Err(err) = updater.writable() {
                if !matches!(err, ProxyError::Wait) {
                    self.refreshing = false;
                    return Ok(Outcome::Reap);
                }
            }
        }

        if readable {
            match updater.readable() {
                Ok(Some(map)) => {
                    logging::info!(self.log, "slot map refreshed"; "ranges" => map.len());
                    self.refreshing = false;
                    self.apply_refreshed_map(map);
                    return Ok(Outcome::Reap);
                }
                Ok(None) => {}
                Err(ProxyError::Wait) => {}
                Err(ProxyError::Fatal(_)) => {
                    self.refreshing = false;
                    return Ok(Outcome::Reap);
                }
            }
        }

        Ok(Outcome::Keep)
    }

    fn apply_refreshed_map(&mut self, map: std::collections::BTreeMap<u16, Address>) {
        let evicted = self.slots.set_map(map);
        for idx in evicted {
            if let Some(mut conn) = self.connections[idx].take() {
                let _ = self.deregister(&mut conn);
            }
            self.free.push(idx);
        }
    }

    /// Starts a one-shot `CLUSTER NODES` fetch, unless one is already in
    /// flight. Targets a live backend if one exists, falling back to the
    /// configured seed list.
    fn trigger_refresh(&mut self) -> ProxyResult<()> {
        if self.refreshing {
            return Ok(());
        }

        let target = self
            .slots
            .live_addresses()
            .next()
            .cloned()
            .unwrap_or_else(|| self.config.seed.clone());

        let updater = SlotMapUpdater::connect(target)?;
        let idx = self.insert_connection(Connection::Updater(updater));
        self.register(idx, BOTH)?;
        self.refreshing = true;
        Ok(())
    }

    fn process_retry_queue(&mut self) -> ProxyResult<()> {
        let items: Vec<RetryItem> = self.retry_queue.drain(..).collect();

        for item in items {
            let still_alive = matches!(
                self.connections.get(item.client),
                Some(Some(Connection::Client(_)))
            );
            if !still_alive {
                continue;
            }

            self.stage_command(item.client, item.group, item.index_in_group, item.raw, item.target)?;
        }

        Ok(())
    }

    fn process_pending_deliveries(&mut self) -> ProxyResult<()> {
        let items: Vec<PendingDelivery> = self.pending_deliveries.drain(..).collect();

        for item in items {
            self.deliver(item.client, item.group, item.index_in_group, item.data)?;
        }

        Ok(())
    }

    fn stage_command(
        &mut self,
        client: ClientId,
        group: GroupId,
        index_in_group: usize,
        raw: Vec<u8>,
        target: RetryTarget,
    ) -> ProxyResult<()> {
        let (addr, asking) = match target {
            RetryTarget::Route(route) => {
                let addr = match route {
                    Route::NoKey => self.slots.random_addr().cloned(),
                    Route::Slot(slot) => self.slots.addr_for_slot(slot).cloned(),
                };
                match addr {
                    Some(addr) => (addr, false),
                    None => {
                        logging::warn!(self.log, "no backend covers this route, replying CLUSTERDOWN";
                            "client" => client, "error" => ProxyError::cluster_down().to_string());
                        // Deferred rather than delivered right here: this can run
                        // reentrantly from `route_new_group` while `client`'s own
                        // slot is still taken out of `connections`, so a `deliver`
                        // issued now would find nothing to write to.
                        self.pending_deliveries.push_back(PendingDelivery {
                            client,
                            group,
                            index_in_group,
                            data: CLUSTERDOWN_REPLY.to_vec(),
                        });
                        self.trigger_refresh()?;
                        return Ok(());
                    }
                }
            }
            RetryTarget::Forced(addr, asking) => (addr, asking),
        };

        // Recovered for the rare case this exact staged command later fails
        // again (backend dies before writing it) and needs a fresh,
        // key-based reroute rather than repeating a stale forced target.
        let route = target_route_hint(&raw).unwrap_or(Route::NoKey);

        let (backend_id, freshly_connected) = self.backend_id_for_addr(&addr)?;
        let mut conn = match self.connections.get_mut(backend_id).and_then(Option::take) {
            Some(c) => c,
            None => return Ok(()),
        };

        let mut over_watermark = false;
        let mut reap = false;
        let mut fail_err = None;
        if let Connection::Backend(backend) = &mut conn {
            backend.stage(QueuedCommand {
                client,
                group,
                index_in_group,
                raw,
                route,
                asking,
            });
            over_watermark = backend.staged_len() > self.config.staged_high_water;

            // A freshly opened connection hasn't completed its handshake
            // yet; the writable edge it eventually fires will pick up what
            // was just staged. An already-connected backend's writable
            // edge fired long ago and won't fire again on its own, so flush
            // here instead of leaving this staged forever.
            if !freshly_connected {
                match backend.writable() {
                    Ok(()) => {}
                    Err(ProxyError::Wait) => {}
                    Err(ProxyError::Fatal(_)) => {
                        if let Err(err) = self.fail_backend(backend) {
                            fail_err = Some(err);
                        }
                        reap = true;
                    }
                }
            }
        }

        if reap {
            let _ = self.deregister(&mut conn);
            self.free.push(backend_id);
        } else {
            self.connections[backend_id] = Some(conn);
        }

        if over_watermark {
            if let Some(Connection::Client(session)) = self.connections.get_mut(client).and_then(Option::as_mut) {
                session.pause();
                self.paused_clients.insert(client);
            }
        }

        if let Some(err) = fail_err {
            return Err(err);
        }

        Ok(())
    }

    /// Resolves (and lazily creates) the backend for `addr`. The returned
    /// flag is `true` when the connection was just opened this call, so
    /// the caller knows whether a write-readiness edge is still pending.
    fn backend_id_for_addr(&mut self, addr: &Address) -> ProxyResult<(BackendId, bool)> {
        if let Some(&id) = self.slots.get(addr) {
            return Ok((id, false));
        }

        let backend = BackendSession::connect(
            addr.clone(),
            self.config.read_buffer_bytes,
            self.config.write_buffer_bytes,
            &self.log,
        )?;
        let idx = self.insert_connection(Connection::Backend(backend));
        self.register(idx, BOTH)?;
        self.slots.set(addr.clone(), idx);
        Ok((idx, true))
    }

    fn insert_connection(&mut self, conn: Connection) -> usize {
        let idx = self.reserve_slot();
        self.connections[idx] = Some(conn);
        idx
    }

    /// Claims a slab index without installing a connection yet, for the
    /// rare case where the id is needed to construct the value that will
    /// occupy it (a `ClientSession` is keyed by its own slot index).
    fn reserve_slot(&mut self) -> usize {
        if let Some(idx) = self.free.pop() {
            idx
        } else {
            self.connections.push(None);
            self.connections.len() - 1
        }
    }

    fn register(&mut self, idx: usize, interest: Interest) -> ProxyResult<()> {
        let token = Token(idx);
        let registry = self.poll.registry();
        match self.connections[idx].as_mut().unwrap() {
            Connection::Listener(l) => registry.register(l, token, interest)?,
            Connection::Client(c) => registry.register(c.stream_mut(), token, interest)?,
            Connection::Backend(b) => registry.register(b.stream_mut(), token, interest)?,
            Connection::Updater(u) => registry.register(u.stream_mut(), token, interest)?,
        }
        Ok(())
    }

    fn deregister(&mut self, conn: &mut Connection) -> ProxyResult<()> {
        let registry = self.poll.registry();
        let result = match conn {
            Connection::Listener(l) => registry.deregister(l),
            Connection::Client(c) => registry.deregister(c.stream_mut()),
            Connection::Backend(b) => registry.deregister(b.stream_mut()),
            Connection::Updater(u) => registry.deregister(u.stream_mut()),
        };
        result.map_err(ProxyError::from)
    }
}

/// Best-effort re-derivation of a queued command's route from its raw
/// bytes, so a forced (`MOVED`/`ASK`) retry that itself later needs a
/// plain reroute (e.g. the backend it was pinned to also dies) doesn't
/// lose key-based routing.
fn target_route_hint(raw: &[u8]) -> Option<Route> {
    let range = crate::frame::split(raw).ok()?.frames.first()?.clone();
    struct KeyVisitor {
        seen: usize,
        key: Option<Vec<u8>>,
    }
    impl crate::frame::Visitor for KeyVisitor {
        fn on_integer(&mut self, _value: i64) {
            self.seen += 1;
        }
        fn on_simple_string(&mut self, _bytes: &[u8]) {
            self.seen += 1;
        }
        fn on_bulk_string(&mut self, bytes: &[u8]) {
            if self.seen == 1 {
                self.key = Some(bytes.to_vec());
            }
            self.seen += 1;
        }
        fn on_error(&mut self, _bytes: &[u8]) {
            self.seen += 1;
        }
        fn on_array(&mut self, _len: usize) {}
        fn on_nil(&mut self) {
            self.seen += 1;
        }
    }
    let mut visitor = KeyVisitor { seen: 0, key: None };
    crate::frame::parse(raw, range, &mut visitor).ok()?;
    Some(match visitor.key {
        Some(key) => Route::Slot(crate::slot::key_slot(&key)),
        None => Route::NoKey,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerberus_support::logging;
    use std::io::{Read, Write};
    use std::net::TcpListener as StdListener;
    use std::net::TcpStream as StdStream;
    use std::time::Duration;

    fn encode(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", parts.len()).into_bytes();
        for p in parts {
            out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
            out.extend_from_slice(p);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    fn bulk(body: &[u8]) -> Vec<u8> {
        let mut out = format!("${}\r\n", body.len()).into_bytes();
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn routes_a_client_command_through_a_backend_and_back() {
        let backend_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();

        let config = Config {
            listen: Address::new("127.0.0.1", 0),
            seed: Address::new(backend_addr.ip().to_string(), backend_addr.port()),
            read_buffer_bytes: 4096,
            write_buffer_bytes: 4096,
            staged_high_water: 4096,
        };
        let mut proxy = Proxy::new(config, logging::discard()).unwrap();
        let listen_addr = match proxy.connections[0].as_ref().unwrap() {
            Connection::Listener(l) => l.local_addr().unwrap(),
            _ => unreachable!(),
        };

        // The initial topology fetch: accept the updater's connection,
        // answer its CLUSTER NODES request with a single master covering
        // every slot, pointed back at this same listener.
        proxy.tick(Some(Duration::from_millis(50))).unwrap();
        let (mut backend_conn, _) = backend_listener.accept().unwrap();
        backend_conn.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let mut request = [0u8; 64];
        let n = backend_conn.read(&mut request).unwrap();
        assert!(request[..n].ends_with(b"NODES\r\n"));

        let nodes_line = format!(
            "id1 {}:{} master - 0 0 0 connected 0-16383\n",
            backend_addr.ip(),
            backend_addr.port()
        );
        backend_conn.write_all(&bulk(nodes_line.as_bytes())).unwrap();

        for _ in 0..200 {
            if !proxy.refreshing {
                break;
            }
            proxy.tick(Some(Duration::from_millis(10))).unwrap();
        }
        assert!(!proxy.refreshing, "timed out waiting for slot map refresh");

        // Now connect a client and send a pipelined GET. This opens a
        // second, persistent connection to the backend, distinct from the
        // updater's one-shot connection used above.
        let mut client = StdStream::connect(listen_addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        client.write_all(&encode(&[b"GET", b"hello"])).unwrap();

        for _ in 0..20 {
            proxy.tick(Some(Duration::from_millis(10))).unwrap();
        }

        let (mut backend_conn, _) = backend_listener.accept().unwrap();
        backend_conn.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let mut cmd_buf = [0u8; 64];
        let n = backend_conn.read(&mut cmd_buf).unwrap();
        assert_eq!(&cmd_buf[..n], encode(&[b"GET", b"hello"]).as_slice());

        backend_conn.write_all(&bulk(b"world")).unwrap();

        for _ in 0..20 {
            proxy.tick(Some(Duration::from_millis(10))).unwrap();
        }

        let mut chunk = [0u8; 64];
        let n = client.read(&mut chunk).unwrap();
        assert_eq!(&chunk[..n], bulk(b"world").as_slice());
    }

    #[test]
    fn replies_clusterdown_when_no_backend_covers_the_route() {
        let backend_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();

        let config = Config {
            listen: Address::new("127.0.0.1", 0),
            seed: Address::new(backend_addr.ip().to_string(), backend_addr.port()),
            read_buffer_bytes: 4096,
            write_buffer_bytes: 4096,
            staged_high_water: 4096,
        };
        let mut proxy = Proxy::new(config, logging::discard()).unwrap();
        let listen_addr = match proxy.connections[0].as_ref().unwrap() {
            Connection::Listener(l) => l.local_addr().unwrap(),
            _ => unreachable!(),
        };

        // Accept the updater's connection but never answer its CLUSTER
        // NODES request, so the slot map never becomes covered.
        proxy.tick(Some(Duration::from_millis(50))).unwrap();
        let (_updater_conn, _) = backend_listener.accept().unwrap();

        let mut client = StdStream::connect(listen_addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        client.write_all(&encode(&[b"GET", b"hello"])).unwrap();

        for _ in 0..20 {
            proxy.tick(Some(Duration::from_millis(10))).unwrap();
        }

        let mut chunk = [0u8; 64];
        let n = client.read(&mut chunk).unwrap();
        assert_eq!(&chunk[..n], CLUSTERDOWN_REPLY);
    }
}
