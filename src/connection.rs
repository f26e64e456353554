//! Connection dispatcher (component C4, spec.md §4.4) and the public
//! entry point tying every other component together.
//!
//! One reader task demultiplexes inbound messages to channel states or
//! global handlers (§4.4); one writer task serializes everything queued
//! for the peer, fed by a single mailbox so per-channel `Data/Eof/Close`
//! ordering is never interleaved by two tasks racing the transport
//! (spec.md §5 "Tasks per connection").

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::channel::{
    mark_closed_first_time, Channel, ChannelId, ChannelState, ChannelTable, Opening, PendingApp,
    RemoteWindow,
};
use crate::config::{Config, DuplexHandler, Identity, SessionCommand};
use crate::direct_tcpip::{run_duplex_supervisor, DuplexBuffers};
use crate::error::{Error, Result};
use crate::msg::{
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenType,
    ChannelRequestBody, Disconnect, GlobalRequest, Message, RequestSuccess,
};
use crate::name::{globalreq, Address, Name};
use crate::session::{apply_pre_exec_request, run_session_supervisor, SessionBuffers};
use crate::switchboard::ForwardOpener;
use crate::transport::{split, MessageSink, MessageSource, MessageStream};
use crate::wire::get_u32;

/// Which side of the connection protocol we're playing. Both roles run
/// the same dispatcher; only which global requests/channel opens are
/// accepted differs (spec.md §4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

struct Shared {
    role: Role,
    config: Config,
    identity: Identity,
    channels: Arc<Mutex<ChannelTable>>,
    pending_global: Mutex<VecDeque<oneshot::Sender<Option<Bytes>>>>,
    outbox: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ForwardOpener for Shared {
    async fn open_forwarded_tcpip(
        &self,
        bound: Address,
        originator: Address,
        handler: Box<dyn DuplexHandler>,
    ) -> Result<()> {
        open_duplex_channel(
            self,
            ChannelOpenType::ForwardedTcpIp {
                address_connected: bound.host,
                port_connected: bound.port as u32,
                originator_address: originator.host,
                originator_port: originator.port as u32,
            },
            handler,
        )
        .await
    }
}

/// A cheap-to-clone reference to a running connection. Every channel
/// supervisor and the dispatcher itself hold one; the host application
/// uses it to initiate channels and forwarding requests.
#[derive(Clone)]
pub struct ConnectionHandle(Arc<Shared>);

impl ConnectionHandle {
    pub fn identity(&self) -> &Identity {
        &self.0.identity
    }

    pub fn role(&self) -> Role {
        self.0.role
    }

    /// A [`ForwardOpener`] scoped to this connection's own lifetime, for
    /// registering with a [`crate::switchboard::Switchboard`]. The
    /// switchboard entry dies on its own once every strong handle to this
    /// connection (held by [`Connection`] and any in-flight supervisor) is
    /// dropped (spec.md §9 design notes).
    pub fn forward_opener(&self) -> Weak<dyn ForwardOpener> {
        Arc::downgrade(&self.0) as Weak<dyn ForwardOpener>
    }

    /// Opens a `direct-tcpip` channel to `target`, running `handler`
    /// against it once the peer confirms (spec.md §3 "Open (local
    /// initiator)").
    pub async fn open_direct_tcpip(
        &self,
        target: Address,
        originator: Address,
        handler: Box<dyn DuplexHandler>,
    ) -> Result<()> {
        open_duplex_channel(
            &self.0,
            ChannelOpenType::DirectTcpIp {
                host_to_connect: target.host,
                port_to_connect: target.port as u32,
                originator_address: originator.host,
                originator_port: originator.port as u32,
            },
            handler,
        )
        .await
    }

    /// Sends `tcpip-forward` and waits for the reply (client side,
    /// spec.md §4.4, §6). Returns the bound address, with the port the
    /// server actually allocated when the request asked for port 0.
    pub async fn request_tcpip_forward(&self, bind: Address) -> Result<Address> {
        let body = crate::msg::TcpipForward {
            bind_address: bind.host.clone(),
            bind_port: bind.port as u32,
        }
        .encode();
        let reply = send_global_request(&self.0, globalreq::TCPIP_FORWARD.into(), body).await?;
        match reply {
            Some(mut data) if data.len() >= 4 => {
                let port = get_u32(&mut data)?;
                Ok(Address::new(bind.host, port as u16))
            }
            _ => Ok(bind),
        }
    }

    pub async fn cancel_tcpip_forward(&self, bind: Address) -> Result<()> {
        let body = crate::msg::TcpipForward {
            bind_address: bind.host,
            bind_port: bind.port as u32,
        }
        .encode();
        send_global_request(&self.0, globalreq::CANCEL_TCPIP_FORWARD.into(), body).await?;
        Ok(())
    }
}

async fn send_global_request(
    shared: &Arc<Shared>,
    name: Name,
    body: Bytes,
) -> Result<Option<Bytes>> {
    let (tx, rx) = oneshot::channel();
    shared.pending_global.lock().await.push_back(tx);
    shared
        .outbox
        .send(Message::GlobalRequest(GlobalRequest {
            name,
            want_reply: true,
            body,
        }))
        .map_err(|_| Error::bug("outbox closed while sending global request"))?;
    rx.await.map_err(|_| Error::protocol("global request reply never arrived"))
}

/// Shared local-open handshake for `direct-tcpip` and `forwarded-tcpip`:
/// allocate an id, send `ChannelOpen`, wait for the peer's confirmation
/// or failure, and on success spawn the duplex supervisor (spec.md §3
/// "Open (local initiator)").
async fn open_duplex_channel(
    shared: &Arc<Shared>,
    channel_type: ChannelOpenType,
    handler: Box<dyn DuplexHandler>,
) -> Result<()> {
    let queue_size = shared.config.channel_max_queue_size;
    let buffers = DuplexBuffers::new(queue_size);
    let app = match &channel_type {
        ChannelOpenType::ForwardedTcpIp { .. } => PendingApp::ForwardedTcpIp(buffers),
        _ => PendingApp::DirectTcpIp(buffers),
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let local_id = {
        let mut table = shared.channels.lock().await;
        table.begin_open(Opening {
            app,
            reply: reply_tx,
        })?
    };
    let open = Message::ChannelOpen(ChannelOpen {
        sender_channel: local_id,
        initial_window: queue_size,
        max_packet: shared.config.channel_max_packet_size,
        channel_type,
    });
    shared
        .outbox
        .send(open)
        .map_err(|_| Error::bug("outbox closed while opening channel"))?;

    match reply_rx
        .await
        .map_err(|_| Error::bug("dispatcher dropped channel-open reply"))?
    {
        Err(failure) => Err(Error::open_failure(failure.description)),
        Ok(()) => {
            let remote_id = {
                let table = shared.channels.lock().await;
                match table.get(local_id) {
                    Some(ChannelState::Running(chan)) => chan.remote_id,
                    _ => return Err(Error::bug("channel vanished after confirmation")),
                }
            };
            let task = tokio::spawn(run_duplex_supervisor(
                handler,
                local_id,
                remote_id,
                shared.channels.clone(),
                shared.outbox.clone(),
            ));
            register_supervisor(&shared.channels, local_id, task.abort_handle()).await;
            Ok(())
        }
    }
}

/// Overwrites a channel's placeholder supervisor handle with the real
/// spawned task's, so that a later channel/connection close actually
/// cancels the running supervisor (spec.md §5 "Cancellation") instead of
/// the already-finished placeholder from [`accept_channel`]/
/// [`handle_channel_open_confirmation`].
async fn register_supervisor(
    channels: &Arc<Mutex<ChannelTable>>,
    local_id: ChannelId,
    supervisor: tokio::task::AbortHandle,
) {
    let mut table = channels.lock().await;
    if let Some(ChannelState::Running(chan)) = table.get_mut(local_id) {
        chan.supervisor = supervisor;
    }
}

/// An active connection: the reader/writer tasks and the handle used to
/// drive it. Dropping this aborts both tasks and every channel
/// supervisor once the last strong reference to `Shared` goes away
/// (spec.md §5 "Cancellation").
pub struct Connection {
    handle: ConnectionHandle,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    /// Splits `stream` into reader/writer halves and spawns the
    /// dispatcher (spec.md §5 "Tasks per connection").
    pub fn connect<S>(role: Role, config: Config, identity: Identity, stream: S) -> Self
    where
        S: MessageStream + 'static,
    {
        let (source, sink) = split(stream);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let max_count = config.channel_max_count;
        let shared = Arc::new(Shared {
            role,
            config,
            identity,
            channels: Arc::new(Mutex::new(ChannelTable::new(max_count))),
            pending_global: Mutex::new(VecDeque::new()),
            outbox: outbox_tx,
        });
        let handle = ConnectionHandle(shared);

        let writer_task = tokio::spawn(writer_loop(sink, outbox_rx));
        let reader_task = tokio::spawn(reader_loop(source, handle.clone()));

        Connection {
            handle,
            reader_task,
            writer_task,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Tears down the connection: aborts every channel supervisor and
    /// releases switchboard registrations, then stops the reader task
    /// directly rather than waiting for the transport to reach EOF on its
    /// own, satisfying the client-side graceful-shutdown draining
    /// spec.md §9 calls for. The writer task follows once every
    /// `ConnectionHandle` clone (this one, the reader's, each aborted
    /// supervisor's) has actually been dropped and the outbox channel
    /// closes.
    pub async fn shutdown(self) {
        let Connection {
            handle,
            reader_task,
            writer_task,
        } = self;
        teardown(&handle).await;
        reader_task.abort();
        drop(handle);
        let _ = reader_task.await;
        let _ = writer_task.await;
    }
}

async fn writer_loop<S>(mut sink: S, mut outbox: mpsc::UnboundedReceiver<Message>)
where
    S: MessageSink,
{
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = sink.send(msg).await {
            error!("writer task: transport send failed: {e}");
            break;
        }
    }
    trace!("writer task finished");
}

async fn reader_loop<S>(mut source: S, handle: ConnectionHandle)
where
    S: MessageSource,
{
    loop {
        match source.receive().await {
            Ok(Some(msg)) => {
                if let Err(e) = dispatch(&handle, msg).await {
                    warn!("protocol error, disconnecting: {e}");
                    let _ = handle.0.outbox.send(Message::Disconnect(
                        Disconnect::protocol_error(e.to_string()),
                    ));
                    break;
                }
            }
            Ok(None) => {
                debug!("transport reached end of stream");
                break;
            }
            Err(e) => {
                error!("reader task: transport receive failed: {e}");
                break;
            }
        }
    }
    teardown(&handle).await;
}

async fn teardown(handle: &ConnectionHandle) {
    handle.0.channels.lock().await.abort_all();
    if let Some(switchboard) = &handle.0.config.switchboard {
        switchboard.cancel_all_for(handle.identity()).await;
    }
}

async fn dispatch(handle: &ConnectionHandle, msg: Message) -> Result<()> {
    match msg {
        Message::Disconnect(d) => {
            debug!("peer disconnected: reason={} msg={}", d.reason, d.description);
            Err(Error::protocol("peer sent Disconnect"))
        }
        Message::GlobalRequest(req) => handle_global_request(handle, req).await,
        Message::RequestSuccess(r) => {
            resolve_pending_global(handle, Some(r.data)).await;
            Ok(())
        }
        Message::RequestFailure => {
            resolve_pending_global(handle, None).await;
            Ok(())
        }
        Message::ChannelOpen(open) => handle_channel_open(handle, open).await,
        Message::ChannelOpenConfirmation(c) => handle_channel_open_confirmation(handle, c).await,
        Message::ChannelOpenFailure(f) => handle_channel_open_failure(handle, f).await,
        Message::ChannelWindowAdjust(w) => {
            let window = {
                let table = handle.0.channels.lock().await;
                match table.get(w.recipient_channel) {
                    Some(ChannelState::Running(chan)) => Some(chan.remote_window.clone()),
                    _ => None,
                }
            };
            if let Some(window) = window {
                window.increase(w.bytes_to_add).await?;
            }
            Ok(())
        }
        Message::ChannelData(d) => deliver_data(handle, d.recipient_channel, d.data, None).await,
        Message::ChannelExtendedData(d) => {
            deliver_data(handle, d.recipient_channel, d.data, Some(d.data_type_code)).await
        }
        Message::ChannelEof(e) => {
            signal_eof(handle, e.recipient_channel).await;
            Ok(())
        }
        Message::ChannelClose(c) => handle_channel_close(handle, c.recipient_channel).await,
        Message::ChannelRequest(r) => handle_channel_request(handle, r).await,
        Message::ChannelSuccess(_) | Message::ChannelFailure(_) => Ok(()),
    }
}

async fn resolve_pending_global(handle: &ConnectionHandle, data: Option<Bytes>) {
    if let Some(tx) = handle.0.pending_global.lock().await.pop_front() {
        let _ = tx.send(data);
    }
}

async fn handle_global_request(handle: &ConnectionHandle, req: GlobalRequest) -> Result<()> {
    if handle.role() != Role::Server {
        if req.want_reply {
            let _ = handle.0.outbox.send(Message::RequestFailure);
        }
        return Ok(());
    }
    let reply = match req.name.as_str() {
        globalreq::TCPIP_FORWARD => {
            let forward = crate::msg::TcpipForward::decode(req.body)?;
            match &handle.0.config.switchboard {
                Some(switchboard) => {
                    let bound = Address::new(forward.bind_address, forward.bind_port as u16);
                    let opener = handle.forward_opener();
                    let ok = switchboard
                        .request_forwarding(handle.identity().clone(), bound, opener)
                        .await;
                    ok.then(|| RequestSuccess::bound_port(forward.bind_port))
                }
                None => None,
            }
        }
        globalreq::CANCEL_TCPIP_FORWARD => {
            let forward = crate::msg::TcpipForward::decode(req.body)?;
            if let Some(switchboard) = &handle.0.config.switchboard {
                let bound = Address::new(forward.bind_address, forward.bind_port as u16);
                switchboard.cancel_forwarding(&bound).await;
                Some(RequestSuccess::empty())
            } else {
                None
            }
        }
        other => {
            trace!("rejecting unknown global request {other}");
            None
        }
    };
    if req.want_reply {
        let msg = match reply {
            Some(success) => Message::RequestSuccess(success),
            None => Message::RequestFailure,
        };
        let _ = handle.0.outbox.send(msg);
    }
    Ok(())
}

async fn handle_channel_open(handle: &ConnectionHandle, open: ChannelOpen) -> Result<()> {
    let refuse = |reason, description: &str| {
        Message::ChannelOpenFailure(ChannelOpenFailure::new(
            open.sender_channel,
            reason,
            description.to_string(),
        ))
    };

    match &open.channel_type {
        ChannelOpenType::Session if handle.role() == Role::Server => {
            let queue_size = handle.0.config.channel_max_queue_size;
            let app = crate::channel::Application::Session(SessionBuffers::new(queue_size));
            accept_channel(handle, &open, app).await?;
            Ok(())
        }
        ChannelOpenType::DirectTcpIp {
            host_to_connect,
            port_to_connect,
            ..
        } if handle.role() == Role::Server => {
            match &handle.0.config.on_direct_tcpip_request {
                Some(cb) => match cb(handle.identity(), host_to_connect, *port_to_connect as u16) {
                    Some(dhandler) => {
                        let queue_size = handle.0.config.channel_max_queue_size;
                        let buffers = DuplexBuffers::new(queue_size);
                        let app = crate::channel::Application::DirectTcpIp(buffers);
                        if let Some(local_id) = accept_channel(handle, &open, app).await? {
                            let remote_id = open.sender_channel;
                            let task = tokio::spawn(run_duplex_supervisor(
                                dhandler,
                                local_id,
                                remote_id,
                                handle.0.channels.clone(),
                                handle.0.outbox.clone(),
                            ));
                            register_supervisor(&handle.0.channels, local_id, task.abort_handle())
                                .await;
                        }
                        Ok(())
                    }
                    None => {
                        let _ = handle.0.outbox.send(refuse(
                            crate::msg::open_failure::ADMINISTRATIVELY_PROHIBITED,
                            "direct-tcpip refused by policy",
                        ));
                        Ok(())
                    }
                },
                None => {
                    let _ = handle.0.outbox.send(refuse(
                        crate::msg::open_failure::ADMINISTRATIVELY_PROHIBITED,
                        "direct-tcpip not configured",
                    ));
                    Ok(())
                }
            }
        }
        ChannelOpenType::ForwardedTcpIp {
            address_connected,
            port_connected,
            ..
        } => match &handle.0.config.on_forwarded_tcpip_request {
            Some(cb) => match cb(address_connected, *port_connected as u16) {
                Some(dhandler) => {
                    let queue_size = handle.0.config.channel_max_queue_size;
                    let buffers = DuplexBuffers::new(queue_size);
                    let app = crate::channel::Application::ForwardedTcpIp(buffers);
                    if let Some(local_id) = accept_channel(handle, &open, app).await? {
                        let remote_id = open.sender_channel;
                        let task = tokio::spawn(run_duplex_supervisor(
                            dhandler,
                            local_id,
                            remote_id,
                            handle.0.channels.clone(),
                            handle.0.outbox.clone(),
                        ));
                        register_supervisor(&handle.0.channels, local_id, task.abort_handle())
                            .await;
                    }
                    Ok(())
                }
                None => {
                    let _ = handle.0.outbox.send(refuse(
                        crate::msg::open_failure::ADMINISTRATIVELY_PROHIBITED,
                        "forwarded-tcpip refused by policy",
                    ));
                    Ok(())
                }
            },
            None => {
                let _ = handle.0.outbox.send(refuse(
                    crate::msg::open_failure::ADMINISTRATIVELY_PROHIBITED,
                    "forwarded-tcpip not configured",
                ));
                Ok(())
            }
        },
        ChannelOpenType::Other { name, .. } => {
            let _ = handle.0.outbox.send(refuse(
                crate::msg::open_failure::UNKNOWN_CHANNEL_TYPE,
                &format!("unsupported channel type {name}"),
            ));
            Ok(())
        }
        _ => {
            let _ = handle.0.outbox.send(refuse(
                crate::msg::open_failure::ADMINISTRATIVELY_PROHIBITED,
                "channel type not valid for this role",
            ));
            Ok(())
        }
    }
}

/// Accepts a remote-initiated channel open, installing `app` as
/// `Running` and replying with `ChannelOpenConfirmation`, or refusing
/// with `ChannelOpenResourceShortage` if `channelMaxCount` is already
/// reached (spec.md §3 "Open (remote initiator)"). For session channels
/// this only installs the buffers — the worker itself is spawned later
/// by [`handle_channel_request`] on the first shell/exec/subsystem
/// request (spec.md §4.5 "task-registration discipline").
async fn accept_channel(
    handle: &ConnectionHandle,
    open: &ChannelOpen,
    app: crate::channel::Application,
) -> Result<Option<ChannelId>> {
    let queue_size = handle.0.config.channel_max_queue_size;
    let mut table = handle.0.channels.lock().await;
    let local_id = match table.select_free_local_id() {
        Some(id) => id,
        None => {
            drop(table);
            let _ = handle
                .0
                .outbox
                .send(Message::ChannelOpenFailure(ChannelOpenFailure::new(
                    open.sender_channel,
                    crate::msg::open_failure::RESOURCE_SHORTAGE,
                    "channelMaxCount reached",
                )));
            return Ok(None);
        }
    };
    let chan = Channel {
        local_id,
        remote_id: open.sender_channel,
        remote_window: RemoteWindow::new(open.initial_window),
        remote_max_packet: open.max_packet,
        closed: Arc::new(AtomicBool::new(false)),
        supervisor: placeholder_abort_handle(),
        app,
    };
    table.insert(local_id, ChannelState::Running(chan));
    drop(table);

    let _ = handle
        .0
        .outbox
        .send(Message::ChannelOpenConfirmation(ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: local_id,
            initial_window: queue_size,
            max_packet: handle.0.config.channel_max_packet_size,
        }));
    Ok(Some(local_id))
}

/// A freshly-accepted channel has no live supervisor yet (a session
/// channel's worker only starts once a shell/exec/subsystem request
/// arrives); a `Channel` always needs an `AbortHandle` though, so this
/// gives it one pointing at an already-finished task. It's overwritten
/// with the real supervisor's handle once that task is spawned.
fn placeholder_abort_handle() -> tokio::task::AbortHandle {
    tokio::spawn(async {}).abort_handle()
}

async fn handle_channel_open_confirmation(
    handle: &ConnectionHandle,
    c: ChannelOpenConfirmation,
) -> Result<()> {
    let opening = {
        let mut table = handle.0.channels.lock().await;
        match table.get(c.recipient_channel) {
            Some(ChannelState::Opening(_)) => {}
            _ => return Ok(()),
        }
        match table.remove(c.recipient_channel) {
            Some(ChannelState::Opening(opening)) => opening,
            _ => return Ok(()),
        }
    };
    let app = match opening.app {
        PendingApp::DirectTcpIp(b) => crate::channel::Application::DirectTcpIp(b),
        PendingApp::ForwardedTcpIp(b) => crate::channel::Application::ForwardedTcpIp(b),
        PendingApp::Session(b) => crate::channel::Application::Session(b),
    };
    let chan = Channel {
        local_id: c.recipient_channel,
        remote_id: c.sender_channel,
        remote_window: RemoteWindow::new(c.initial_window),
        remote_max_packet: c.max_packet,
        closed: Arc::new(AtomicBool::new(false)),
        supervisor: placeholder_abort_handle(),
        app,
    };
    handle
        .0
        .channels
        .lock()
        .await
        .insert(c.recipient_channel, ChannelState::Running(chan));
    let _ = opening.reply.send(Ok(()));
    Ok(())
}

async fn handle_channel_open_failure(
    handle: &ConnectionHandle,
    f: ChannelOpenFailure,
) -> Result<()> {
    let opening = {
        let mut table = handle.0.channels.lock().await;
        match table.get(f.recipient_channel) {
            Some(ChannelState::Opening(_)) => table.remove(f.recipient_channel),
            _ => None,
        }
    };
    if let Some(ChannelState::Opening(opening)) = opening {
        let _ = opening.reply.send(Err(f));
    }
    Ok(())
}

async fn deliver_data(
    handle: &ConnectionHandle,
    local_id: ChannelId,
    data: Bytes,
    extended_code: Option<u32>,
) -> Result<()> {
    let (buf, max_packet) = {
        let table = handle.0.channels.lock().await;
        let Some(ChannelState::Running(chan)) = table.get(local_id) else {
            return Err(Error::protocol(format!(
                "data for unknown or non-running channel {local_id}"
            )));
        };
        let buf = match (&chan.app, extended_code) {
            (crate::channel::Application::Session(b), None) => b.stdin.clone(),
            (crate::channel::Application::Session(_), Some(_)) => {
                return Err(Error::protocol("ExtendedData not valid inbound on session"))
            }
            (crate::channel::Application::DirectTcpIp(b), None) => b.incoming.clone(),
            (crate::channel::Application::ForwardedTcpIp(b), None) => b.incoming.clone(),
            (_, Some(_)) => {
                return Err(Error::protocol("ExtendedData not valid on this channel type"))
            }
        };
        (buf, chan.remote_max_packet)
    };
    if data.len() as u32 > max_packet {
        return Err(Error::protocol("inbound packet exceeds channelMaxPacketSize"));
    }
    if buf.ask_eof().await {
        return Err(Error::protocol("data received after EOF"));
    }
    let written = buf.enqueue_short(&data).await?;
    if written < data.len() {
        return Err(Error::protocol(
            "window-underrun: peer sent more than advertised window",
        ));
    }
    Ok(())
}

async fn signal_eof(handle: &ConnectionHandle, local_id: ChannelId) {
    let table = handle.0.channels.lock().await;
    if let Some(ChannelState::Running(chan)) = table.get(local_id) {
        match &chan.app {
            crate::channel::Application::Session(b) => b.stdin.send_eof().await,
            crate::channel::Application::DirectTcpIp(b) => b.incoming.send_eof().await,
            crate::channel::Application::ForwardedTcpIp(b) => b.incoming.send_eof().await,
        }
    }
}

async fn handle_channel_close(handle: &ConnectionHandle, local_id: ChannelId) -> Result<()> {
    let removed = {
        let mut table = handle.0.channels.lock().await;
        table.remove(local_id)
    };
    let Some(ChannelState::Running(chan)) = removed else {
        return Ok(());
    };
    chan.supervisor.abort();
    if mark_closed_first_time(&chan.closed) {
        let _ = handle
            .0
            .outbox
            .send(Message::ChannelClose(crate::msg::ChannelClose {
                recipient_channel: chan.remote_id,
            }));
    }
    Ok(())
}

async fn handle_channel_request(
    handle: &ConnectionHandle,
    req: crate::msg::ChannelRequest,
) -> Result<()> {
    let local_id = req.recipient_channel;
    let found = {
        let table = handle.0.channels.lock().await;
        match table.get(local_id) {
            Some(ChannelState::Running(chan)) => match &chan.app {
                crate::channel::Application::Session(buffers) => Some((
                    chan.remote_id,
                    SessionBuffers {
                        stdin: buffers.stdin.clone(),
                        stdout: buffers.stdout.clone(),
                        stderr: buffers.stderr.clone(),
                        env: buffers.env.clone(),
                        pty: buffers.pty.clone(),
                    },
                )),
                _ => None,
            },
            _ => None,
        }
    };

    let Some((remote_id, buffers)) = found else {
        if req.want_reply {
            let _ = handle
                .0
                .outbox
                .send(Message::ChannelFailure(crate::msg::ChannelFailure {
                    recipient_channel: req.recipient_channel,
                }));
        }
        return Ok(());
    };

    let starts_worker = apply_pre_exec_request(&buffers, &req).await;
    if starts_worker {
        let command = SessionCommand::from_request(&req.body)
            .ok_or_else(|| Error::bug("starts_worker implies from_request is Some"))?;
        let session_handler = handle
            .0
            .config
            .on_session_request
            .as_ref()
            .and_then(|cb| cb(handle.identity()));
        match session_handler {
            Some(session_handler) => {
                let task = tokio::spawn(run_session_supervisor(
                    session_handler,
                    command,
                    local_id,
                    remote_id,
                    handle.0.channels.clone(),
                    handle.0.outbox.clone(),
                ));
                register_supervisor(&handle.0.channels, local_id, task.abort_handle()).await;
                if req.want_reply {
                    let _ = handle
                        .0
                        .outbox
                        .send(Message::ChannelSuccess(crate::msg::ChannelSuccess {
                            recipient_channel: remote_id,
                        }));
                }
            }
            None if req.want_reply => {
                let _ = handle
                    .0
                    .outbox
                    .send(Message::ChannelFailure(crate::msg::ChannelFailure {
                        recipient_channel: remote_id,
                    }));
            }
            None => {}
        }
    } else if req.want_reply {
        // Only Env/PtyReq are actually handled pre-exec state; WindowChange
        // and Signal are parsed just so they can be refused cleanly here
        // rather than silently dropped (spec.md §1 non-goals), same as any
        // unrecognized `Other` request.
        let accepted = matches!(
            req.body,
            ChannelRequestBody::Env { .. } | ChannelRequestBody::PtyReq { .. }
        );
        let reply = if accepted {
            Message::ChannelSuccess(crate::msg::ChannelSuccess {
                recipient_channel: remote_id,
            })
        } else {
            Message::ChannelFailure(crate::msg::ChannelFailure {
                recipient_channel: remote_id,
            })
        };
        let _ = handle.0.outbox.send(reply);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    use super::*;
    use crate::config::{ExitOutcome, SessionHandler};
    use crate::msg::{ChannelData, ChannelRequest, ChannelSuccess};
    use crate::session::SessionIo;

    struct FakeStream {
        inbound: UnboundedReceiver<Message>,
        outbound: UnboundedSender<Message>,
    }

    #[async_trait]
    impl MessageStream for FakeStream {
        async fn send(&mut self, msg: Message) -> Result<()> {
            let _ = self.outbound.send(msg);
            Ok(())
        }

        async fn receive(&mut self) -> Result<Option<Message>> {
            Ok(self.inbound.recv().await)
        }
    }

    /// Wires a test harness directly to a `Connection`'s transport: `to_server`
    /// feeds its reader task, `from_server` observes everything its writer
    /// task emits.
    fn harness() -> (FakeStream, UnboundedSender<Message>, UnboundedReceiver<Message>) {
        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (from_server_tx, from_server_rx) = mpsc::unbounded_channel();
        (
            FakeStream {
                inbound: to_server_rx,
                outbound: from_server_tx,
            },
            to_server_tx,
            from_server_rx,
        )
    }

    async fn recv(rx: &mut UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbox closed")
    }

    async fn open_session(to_server: &UnboundedSender<Message>, from_server: &mut UnboundedReceiver<Message>) {
        to_server
            .send(Message::ChannelOpen(ChannelOpen {
                sender_channel: 0,
                initial_window: 32_768,
                max_packet: 32_768,
                channel_type: ChannelOpenType::Session,
            }))
            .unwrap();
        match recv(from_server).await {
            Message::ChannelOpenConfirmation(c) => assert_eq!(c.recipient_channel, 0),
            other => panic!("expected ChannelOpenConfirmation, got {other:?}"),
        }
    }

    struct EchoHiHandler;

    #[async_trait]
    impl SessionHandler for EchoHiHandler {
        async fn run(self: Box<Self>, _command: SessionCommand, io: SessionIo) -> ExitOutcome {
            io.stdout.enqueue_short(b"hi").await.unwrap();
            ExitOutcome::Status(0)
        }
    }

    struct ExplodingHandler;

    #[async_trait]
    impl SessionHandler for ExplodingHandler {
        async fn run(self: Box<Self>, _command: SessionCommand, _io: SessionIo) -> ExitOutcome {
            ExitOutcome::Exception("boom".into())
        }
    }

    fn server_config(handler_factory: impl Fn() -> Box<dyn SessionHandler> + Send + Sync + 'static) -> Config {
        Config {
            on_session_request: Some(Arc::new(move |_identity| Some(handler_factory()))),
            ..Config::default()
        }
    }

    /// spec.md §8 S1: exec on a session that writes "hi" and exits 0 yields
    /// ChannelSuccess, ChannelData("hi"), ChannelEof, exit-status(0),
    /// ChannelClose, in that relative order.
    #[tokio::test]
    async fn s1_session_exec_success_sequence() {
        let (stream, to_server, mut from_server) = harness();
        let config = server_config(|| Box::new(EchoHiHandler));
        let connection = Connection::connect(Role::Server, config, Identity::unauthenticated(), stream);

        open_session(&to_server, &mut from_server).await;
        to_server
            .send(Message::ChannelRequest(ChannelRequest {
                recipient_channel: 0,
                want_reply: true,
                body: ChannelRequestBody::Exec {
                    command: "echo".into(),
                },
            }))
            .unwrap();

        let mut saw_success = false;
        let mut saw_data = false;
        let mut saw_eof = false;
        let mut saw_exit_status = false;
        loop {
            match recv(&mut from_server).await {
                Message::ChannelSuccess(ChannelSuccess { .. }) => {
                    assert!(!saw_data && !saw_eof, "ChannelSuccess must come first");
                    saw_success = true;
                }
                Message::ChannelData(ChannelData { data, .. }) => {
                    assert!(saw_success && !saw_eof, "Data must follow Success, precede Eof");
                    assert_eq!(&data[..], b"hi");
                    saw_data = true;
                }
                Message::ChannelEof(_) => {
                    assert!(saw_data, "Eof must follow Data");
                    saw_eof = true;
                }
                Message::ChannelRequest(ChannelRequest {
                    body: ChannelRequestBody::ExitStatus { code },
                    ..
                }) => {
                    assert!(saw_eof, "exit-status must follow Eof");
                    assert_eq!(code, 0);
                    saw_exit_status = true;
                }
                Message::ChannelClose(_) => {
                    assert!(saw_exit_status, "Close must be last");
                    break;
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }

        connection.shutdown().await;
    }

    /// spec.md §8 S2: a handler exception yields Eof, exit-signal("ILL"),
    /// Close — no Data in between.
    #[tokio::test]
    async fn s2_session_handler_exception_sequence() {
        let (stream, to_server, mut from_server) = harness();
        let config = server_config(|| Box::new(ExplodingHandler));
        let connection = Connection::connect(Role::Server, config, Identity::unauthenticated(), stream);

        open_session(&to_server, &mut from_server).await;
        to_server
            .send(Message::ChannelRequest(ChannelRequest {
                recipient_channel: 0,
                want_reply: true,
                body: ChannelRequestBody::Shell,
            }))
            .unwrap();

        assert!(matches!(recv(&mut from_server).await, Message::ChannelSuccess(_)));
        assert!(matches!(recv(&mut from_server).await, Message::ChannelEof(_)));
        match recv(&mut from_server).await {
            Message::ChannelRequest(ChannelRequest {
                body: ChannelRequestBody::ExitSignal { signal_name, .. },
                ..
            }) => assert_eq!(signal_name, "ILL"),
            other => panic!("expected exit-signal, got {other:?}"),
        }
        assert!(matches!(recv(&mut from_server).await, Message::ChannelClose(_)));

        connection.shutdown().await;
    }

    /// A window-change request names a rejected, non-goal channel request
    /// (spec.md §1 non-goals): it still gets a `ChannelFailure`, not a
    /// silently-dropped reply.
    #[tokio::test]
    async fn window_change_request_is_rejected_cleanly() {
        let (stream, to_server, mut from_server) = harness();
        let config = server_config(|| Box::new(EchoHiHandler));
        let connection = Connection::connect(Role::Server, config, Identity::unauthenticated(), stream);

        open_session(&to_server, &mut from_server).await;
        to_server
            .send(Message::ChannelRequest(ChannelRequest {
                recipient_channel: 0,
                want_reply: true,
                body: ChannelRequestBody::WindowChange {
                    width_chars: 80,
                    height_rows: 24,
                    width_px: 0,
                    height_px: 0,
                },
            }))
            .unwrap();

        assert!(matches!(recv(&mut from_server).await, Message::ChannelFailure(_)));
        connection.shutdown().await;
    }
}
