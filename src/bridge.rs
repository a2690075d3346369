// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

pub mod buffers;
pub mod callbacks;
pub mod child;
pub mod dispatch;
pub mod dmabuf;
pub mod errors;
pub mod frame_clock;
pub mod latin1;
pub mod region;
pub mod release;
pub mod renderer;
pub mod role;
pub mod serial;
pub mod shm;
pub mod surface;
pub mod timestamp;
pub mod toplevel;
pub mod xdg;
pub mod xserver;

use std::{
    ffi::OsString,
    os::fd::AsRawFd as _,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use anyhow::Context as _;
use hashbrown::HashMap;
use slotmap::SlotMap;
use tracing::{debug, trace, warn};
use wayland_protocols::{
    wp::{
        linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1,
        linux_explicit_synchronization::zv1::server::zwp_linux_explicit_synchronization_v1,
        pointer_constraints::zv1::server::zwp_pointer_constraints_v1,
        viewporter::server::wp_viewporter,
    },
    xdg::{
        decoration::zv1::server::zxdg_decoration_manager_v1, shell::server::xdg_wm_base,
    },
};
use wayland_server::{
    backend::{ClientId, DisconnectReason},
    protocol::{wl_compositor, wl_shm},
    Resource as _,
};
use x11rb::protocol::{self, xproto};

use crate::{
    bridge::{
        buffers::{Buffer, BufferKey},
        child::{client_launch, ProcessSupervisor},
        dmabuf::{DmabufFeedback, PendingImport},
        errors::{oom_victims, ErrorPolicy},
        frame_clock::FrameEvent,
        region::Region,
        renderer::RenderBackend,
        role::{Role, RoleKey},
        serial::Serial,
        shm::{MappedPool, ShmPoolKey},
        surface::{Surface, SurfaceKey},
        timestamp::Clock,
        xserver::{FrameMessage, Xserver},
    },
    config::Config,
};

const XSERVER: mio::Token = mio::Token(0);
const WAYLAND: mio::Token = mio::Token(1);
const ACCEPT: mio::Token = mio::Token(2);
const TIMER: mio::Token = mio::Token(3);
const REAPER: mio::Token = mio::Token(4);
const CHILD_OUT: mio::Token = mio::Token(5);

slotmap::new_key_type! {
    pub struct TimerKey;
    pub struct ConstraintKey;
}

/// What a timer firing means.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimerEvent {
    /// Flush batched window-manager state changes into one configure.
    FlushWmState { surface: SurfaceKey },
    /// An interactive resize stopped producing configures.
    ResizeSettle { surface: SurfaceKey },
}

/// Cancelable one-shot timers, multiplexed over a single timerfd.
#[derive(Default)]
pub struct Timers {
    entries: SlotMap<TimerKey, (Instant, TimerEvent)>,
}

impl Timers {
    pub fn arm(&mut self, after: Duration, event: TimerEvent) -> TimerKey {
        self.entries.insert((Instant::now() + after, event))
    }

    pub fn cancel(&mut self, key: TimerKey) {
        self.entries.remove(key);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(at, _)| *at).min()
    }

    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerEvent> {
        let expired: Vec<TimerKey> = self
            .entries
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(k, _)| k)
            .collect();

        expired
            .into_iter()
            .filter_map(|k| self.entries.remove(k).map(|(_, ev)| ev))
            .collect()
    }
}

/// A pointer constraint record. The barrier machinery underneath belongs to
/// the input layer; the core only tracks the regions and revalidates them
/// when the window moves.
pub struct PointerConstraint {
    pub surface: SurfaceKey,
    pub region: Option<Region>,
    pub oneshot: bool,
    pub moved_hook: Option<callbacks::CallbackKey>,
    pub configure_hook: Option<callbacks::CallbackKey>,
}

pub struct State {
    pub config: Config,
    pub serial: Serial,
    pub clock: Clock,

    pub display: wayland_server::DisplayHandle,

    pub surfaces: SlotMap<SurfaceKey, Surface>,
    pub buffers: SlotMap<BufferKey, Buffer>,
    pub shm_pools: SlotMap<ShmPoolKey, Arc<RwLock<MappedPool>>>,
    pub roles: SlotMap<RoleKey, Role>,
    pub constraints: SlotMap<ConstraintKey, PointerConstraint>,

    /// The surface table: backing window to role.
    pub windows: HashMap<xproto::Window, RoleKey>,
    /// Outstanding wm_base pings, by wayland serial.
    pub ping_serials: HashMap<u32, RoleKey>,

    pub pending_imports: Vec<PendingImport>,
    pub dmabuf_feedback: DmabufFeedback,

    pub timers: Timers,
    pub error_policy: ErrorPolicy,
    pending_disconnects: Vec<ClientId>,

    pub global_scale: i32,

    pub xs: Xserver,
    pub renderer: Box<dyn RenderBackend>,
}

#[derive(Debug, Default)]
pub struct ClientState;

impl wayland_server::backend::ClientData for ClientState {
    fn initialized(&self, _client_id: ClientId) {}
    fn disconnected(&self, _client_id: ClientId, _reason: DisconnectReason) {}
}

pub struct Bridge {
    poll: mio::Poll,
    timer: mio_timerfd::TimerFd,

    display: wayland_server::Display<State>,
    listening_socket: wayland_server::ListeningSocket,
    socket_name: OsString,

    supervisor: ProcessSupervisor,

    state: State,
}

impl Bridge {
    pub fn new(config: Config, renderer: Box<dyn RenderBackend>) -> anyhow::Result<Self> {
        let mut display =
            wayland_server::Display::new().context("failed to create wayland display")?;
        let dh = display.handle();

        create_global::<wl_compositor::WlCompositor>(&dh, 5);
        create_global::<wl_shm::WlShm>(&dh, 1);
        create_global::<xdg_wm_base::XdgWmBase>(&dh, 5);
        create_global::<wp_viewporter::WpViewporter>(&dh, 1);
        create_global::<zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1>(&dh, 4);
        create_global::<zwp_linux_explicit_synchronization_v1::ZwpLinuxExplicitSynchronizationV1>(
            &dh, 2,
        );
        create_global::<zxdg_decoration_manager_v1::ZxdgDecorationManagerV1>(&dh, 1);
        create_global::<zwp_pointer_constraints_v1::ZwpPointerConstraintsV1>(&dh, 1);

        let mut xs =
            Xserver::connect(config.synchronize).context("failed to connect to the X server")?;

        let mut clock = Clock::new();
        xs.init_time_alarms(&mut clock)
            .context("failed to program time alarms")?;

        let dmabuf_feedback = DmabufFeedback::new(renderer.formats(), renderer.main_device())
            .context("failed to build the dmabuf format table")?;

        let poll = mio::Poll::new()?;

        let display_fd = display.backend().poll_fd().as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&display_fd),
            WAYLAND,
            mio::Interest::READABLE,
        )?;

        let x_fd = xs.display_fd().as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&x_fd),
            XSERVER,
            mio::Interest::READABLE,
        )?;

        // Bind the listening socket.
        let socket_name = config
            .socket_name
            .clone()
            .unwrap_or_else(gen_socket_name);
        let runtime_dir: PathBuf = std::env::var_os("XDG_RUNTIME_DIR")
            .context("XDG_RUNTIME_DIR not set")?
            .into();
        let socket_path = runtime_dir.join(&socket_name);
        let listening_socket = wayland_server::ListeningSocket::bind_absolute(socket_path.clone())?;
        debug!(?socket_path, "bound wayland socket");

        let listener_fd = listening_socket.as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&listener_fd),
            ACCEPT,
            mio::Interest::READABLE,
        )?;

        let timer = mio_timerfd::TimerFd::new(mio_timerfd::ClockId::Monotonic)?;
        let timer_fd = timer.as_raw_fd();
        poll.registry().register(
            &mut mio::unix::SourceFd(&timer_fd),
            TIMER,
            mio::Interest::READABLE,
        )?;

        let mut supervisor = ProcessSupervisor::new()?;
        poll.registry().register(
            supervisor.reaper_source(),
            REAPER,
            mio::Interest::READABLE,
        )?;
        poll.registry().register(
            supervisor.output_source(),
            CHILD_OUT,
            mio::Interest::READABLE,
        )?;

        let global_scale = config.global_scale.max(1);

        let state = State {
            config,
            serial: Serial::new(),
            clock,

            display: dh,

            surfaces: SlotMap::default(),
            buffers: SlotMap::default(),
            shm_pools: SlotMap::default(),
            roles: SlotMap::default(),
            constraints: SlotMap::default(),

            windows: HashMap::default(),
            ping_serials: HashMap::default(),

            pending_imports: Vec::new(),
            dmabuf_feedback,

            timers: Timers::default(),
            error_policy: ErrorPolicy::default(),
            pending_disconnects: Vec::new(),

            global_scale,

            xs,
            renderer,
        };

        Ok(Self {
            poll,
            timer,

            display,
            listening_socket,
            socket_name,

            supervisor,

            state,
        })
    }

    pub fn socket_name(&self) -> &OsString {
        &self.socket_name
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        // Launch the client app, if one was given.
        if !self.state.config.command.is_empty() {
            let launch = client_launch(&self.state.config.command, &self.socket_name)?;
            let queue = self.supervisor.create_queue();
            self.supervisor.enqueue(queue, launch)?;
        }

        let mut events = mio::Events::with_capacity(64);

        loop {
            self.poll.poll(&mut events, None)?;

            for event in events.iter() {
                match event.token() {
                    ACCEPT => {
                        if let Some(stream) = self.listening_socket.accept()? {
                            let _client = self
                                .display
                                .handle()
                                .insert_client(stream, Arc::new(ClientState))?;

                            debug!("client connected");
                        }
                    }
                    WAYLAND => {
                        self.display
                            .dispatch_clients(&mut self.state)
                            .context("failed to dispatch the wayland display")?;
                    }
                    XSERVER => {
                        self.state
                            .dispatch_x()
                            .context("failed to dispatch the X connection")?;
                    }
                    TIMER => {
                        self.timer.read()?;
                        for ev in self.state.timers.take_expired(Instant::now()) {
                            self.state.handle_timer(ev);
                        }
                    }
                    REAPER => {
                        self.supervisor.drain()?;
                        if !self.supervisor.busy() && !self.state.config.command.is_empty() {
                            debug!("client process exited; shutting down");
                            return Ok(());
                        }
                    }
                    CHILD_OUT => {
                        self.supervisor.dump_output();
                    }
                    _ => unreachable!(),
                }
            }

            self.idle()?;
        }
    }

    fn idle(&mut self) -> anyhow::Result<()> {
        // Finish asynchronous dmabuf imports.
        self.state.process_pending_imports();

        // Drain deferred buffer releases.
        self.state.process_idle_textures();

        // Resize windows whose content grew or shrank.
        self.state.flush_bounds();

        // Disconnect clients queued by the out-of-memory policy. Doing this
        // from the tick keeps the error handler non-reentrant.
        self.state.disconnect_pending();

        // Flush events to clients and the server.
        self.display.flush_clients()?;
        self.state.xs.maybe_sync()?;
        self.state.xs.flush()?;

        // Re-arm the timer for the nearest deadline.
        if let Some(deadline) = self.state.timers.next_deadline() {
            let after = deadline.saturating_duration_since(Instant::now());
            self.timer.set_timeout(&after.max(Duration::from_millis(1)))?;
        }

        Ok(())
    }
}

impl State {
    /// Drains the X event queue.
    pub fn dispatch_x(&mut self) -> anyhow::Result<()> {
        while let Some(event) = self.xs.poll_event()? {
            self.handle_x_event(event)?;
        }

        Ok(())
    }

    fn handle_x_event(&mut self, event: protocol::Event) -> anyhow::Result<()> {
        use protocol::Event::*;

        match event {
            Error(err) => {
                if self.error_policy.note_error(&err) {
                    self.queue_oom_disconnects();
                }
            }
            SyncAlarmNotify(ev) => {
                let State {
                    ref mut xs,
                    ref mut clock,
                    ..
                } = *self;
                xs.handle_alarm(&ev, clock)?;
            }
            ConfigureNotify(msg) => {
                let Some(role_key) = self.windows.get(&msg.window).copied() else {
                    return Ok(());
                };

                let surface = self.roles[role_key].as_xdg().surface;
                self.run_reconstrain_configure(role_key);
                self.toplevel_wm_configured(
                    surface,
                    msg.x as i32,
                    msg.y as i32,
                    msg.width,
                    msg.height,
                );
                self.run_reconstrain_moved(role_key);
            }
            PropertyNotify(msg) => {
                let Some(role_key) = self.windows.get(&msg.window).copied() else {
                    return Ok(());
                };
                let surface = self.roles[role_key].as_xdg().surface;

                if msg.atom == self.xs.atoms._NET_WM_STATE {
                    self.toplevel_wm_state_changed(surface);
                } else if msg.atom == self.xs.atoms._NET_WM_ALLOWED_ACTIONS {
                    self.toplevel_wm_actions_changed(surface);
                }
            }
            ClientMessage(msg) if msg.type_ == self.xs.atoms.WM_PROTOCOLS => {
                let Some(role_key) = self.windows.get(&msg.window).copied() else {
                    return Ok(());
                };
                let surface = self.roles[role_key].as_xdg().surface;

                let data = msg.data.as_data32();
                if data[0] == self.xs.atoms.WM_DELETE_WINDOW {
                    self.toplevel_close(surface);
                } else if data[0] == self.xs.atoms._NET_WM_PING {
                    self.role_wm_ping(role_key, data[1]);
                } else if data[0] == self.xs.atoms._NET_WM_SYNC_REQUEST {
                    trace!(window = msg.window, "sync request");
                }
            }
            ClientMessage(msg) => {
                let Some(role_key) = self.windows.get(&msg.window).copied() else {
                    return Ok(());
                };

                match self.xs.parse_frame_message(&msg) {
                    Some(FrameMessage::Drawn { id, time_us }) => {
                        let time = self.clock.from_server_time((time_us / 1000) as u32);
                        self.role_note_frame(role_key, FrameEvent::Complete, id, time.as_u64());
                    }
                    Some(FrameMessage::Timings { id, refresh_us }) => {
                        if let Some(role) = self.roles.get_mut(role_key) {
                            role.as_xdg_mut()
                                .frame_clock
                                .handle_frame_timings(id, refresh_us);
                        }
                        self.role_note_frame(role_key, FrameEvent::Presented, id, 0);
                    }
                    None => trace!(window = msg.window, "unhandled client message"),
                }
            }
            MapNotify(msg) => {
                trace!(window = msg.window, "map notify");
            }
            UnmapNotify(msg) => {
                // Nothing will present until the window comes back; re-set
                // the bypass hint.
                if let Some(role_key) = self.windows.get(&msg.window).copied() {
                    self.role_note_frame(role_key, FrameEvent::NotifyDisablePresent, 0, 0);
                }
            }
            DestroyNotify(msg) => {
                self.windows.remove(&msg.window);
            }
            _ => (),
        }

        Ok(())
    }

    fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::FlushWmState { surface } => self.toplevel_flush_wm_state(surface),
            TimerEvent::ResizeSettle { surface } => self.toplevel_resize_settled(surface),
        }
    }

    /// Recomputes view bounds for every window-backed surface. Cheap when
    /// nothing changed; the role ignores identical bounds.
    fn flush_bounds(&mut self) {
        let ids: Vec<SurfaceKey> = self
            .roles
            .values()
            .map(|role| role.as_xdg().surface)
            .collect();

        for id in ids {
            self.role_bounds_changed(id);
        }
    }

    /// Removes a buffer record whose resource is gone and whose release has
    /// resolved.
    pub fn destroy_buffer_if_dead(&mut self, id: BufferKey) {
        let Some(buffer) = self.buffers.get(id) else {
            return;
        };

        if buffer.needs_destruction && !buffer.needs_release {
            let buffer = self.buffers.remove(id).unwrap();
            self.renderer.destroy_texture(buffer.texture);
            trace!(
                wl_buffer = buffer.wl_buffer.id().protocol_id(),
                "destroying buffer"
            );
        }
    }

    /// Buckets clients by their share of allocated pixels and queues the
    /// worst bucket for disconnection at the next tick.
    fn queue_oom_disconnects(&mut self) {
        let mut scores: HashMap<ClientId, u64> = HashMap::new();
        for buffer in self.buffers.values() {
            if let Some(client) = buffer.wl_buffer.client() {
                *scores.entry(client.id()).or_default() += buffer.pixels();
            }
        }

        let scores: Vec<(ClientId, u64)> = scores.into_iter().collect();
        let victims = oom_victims(&scores);

        warn!(
            victims = victims.len(),
            clients = scores.len(),
            "queueing disconnects after memory exhaustion"
        );

        self.pending_disconnects.extend(victims);
    }

    fn disconnect_pending(&mut self) {
        for client_id in std::mem::take(&mut self.pending_disconnects) {
            self.kill_client(client_id);
        }
    }

    /// Posts wl_display.no_memory at the client, which terminates it.
    pub fn post_no_memory(&mut self, client: &wayland_server::Client) {
        self.kill_client(client.id());
    }

    fn kill_client(&mut self, client_id: ClientId) {
        use wayland_server::backend::protocol::ProtocolError;

        debug!(client = ?client_id, "disconnecting client");

        self.display.backend_handle().kill_client(
            client_id,
            DisconnectReason::ProtocolError(ProtocolError {
                code: 2, // wl_display::error::no_memory
                object_id: 1,
                object_interface: "wl_display".to_string(),
                message: "The server is out of memory.".to_string(),
            }),
        );
    }

    /// Revalidates a pointer constraint against the surface's current
    /// input region. The barrier plumbing consumes the result.
    pub fn update_pointer_constraint(&mut self, key: ConstraintKey) {
        let Some(constraint) = self.constraints.get(key) else {
            return;
        };

        let Some(surface) = self.surfaces.get(constraint.surface) else {
            return;
        };

        let mut effective = surface.input_region();
        if let Some(region) = &constraint.region {
            let extents = region.extents();
            effective.intersect_rect(extents);
        }
        if !surface.outputs.is_empty() {
            effective.intersect_rect(surface.outputs.extents());
        }

        trace!(
            ?key,
            oneshot = constraint.oneshot,
            region = ?effective.extents(),
            "constraint region updated"
        );
    }
}

fn create_global<G: wayland_server::Resource + 'static>(
    dh: &wayland_server::DisplayHandle,
    version: u32,
) where
    State: wayland_server::GlobalDispatch<G, ()>,
{
    let _ = dh.create_global::<State, G, ()>(version, ());
}

fn gen_socket_name() -> OsString {
    use rand::Rng;
    let id: u64 = rand::thread_rng().gen();
    format!("waybridge-{}", id).into()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn timers_expire_in_any_order() {
        let mut timers = Timers::default();
        let surface = SurfaceKey::default();

        let _a = timers.arm(Duration::from_millis(10), TimerEvent::FlushWmState { surface });
        let b = timers.arm(
            Duration::from_millis(1000),
            TimerEvent::ResizeSettle { surface },
        );

        let soon = Instant::now() + Duration::from_millis(50);
        assert_eq!(
            timers.take_expired(soon),
            vec![TimerEvent::FlushWmState { surface }]
        );

        timers.cancel(b);
        assert_eq!(timers.next_deadline(), None);
    }
}
