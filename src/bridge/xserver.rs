// Copyright 2025 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The connection to the underlying X server.
//!
//! Everything the bridge asks of the server goes through here: window
//! lifecycle, EWMH properties, the shape extension for input regions, and
//! the sync extension for frame pacing and time-wraparound alarms. Errors
//! for a guarded request range are captured by the trap rather than hitting
//! the global policy.

use std::{collections::VecDeque, os::fd::{AsFd, BorrowedFd}};

use anyhow::Context as _;
use tracing::{debug, trace};
use x11rb::{
    connection::{Connection as _, RequestConnection as _},
    protocol::{
        self, shape,
        sync::{self, ConnectionExt as _},
        xproto::{self, ConnectionExt as _},
    },
    rust_connection::RustConnection,
    wrapper::ConnectionExt as _,
    x11_utils::X11Error,
};

use crate::bridge::{errors::ErrorTrap, latin1, region::Region, timestamp::Clock};

/// Oversize text properties are cut to fit in one request.
const TEXT_PROPERTY_LIMIT: usize = 1 << 16;

x11rb::atom_manager! {
    pub Atoms:
    AtomsCookie {
        UTF8_STRING,

        WM_PROTOCOLS,
        WM_DELETE_WINDOW,
        WM_CHANGE_STATE,
        WM_CLIENT_MACHINE,

        _NET_WM_PID,
        _NET_WM_NAME,
        _NET_WM_PING,
        _NET_WM_SYNC_REQUEST,
        _NET_WM_SYNC_REQUEST_COUNTER,
        _NET_WM_FRAME_DRAWN,
        _NET_WM_FRAME_TIMINGS,
        _NET_WM_OPAQUE_REGION,
        _NET_WM_BYPASS_COMPOSITOR,
        _NET_FRAME_EXTENTS,
        _NET_WM_MOVERESIZE,

        _NET_WM_STATE,
        _NET_WM_STATE_MAXIMIZED_VERT,
        _NET_WM_STATE_MAXIMIZED_HORZ,
        _NET_WM_STATE_FULLSCREEN,
        _NET_WM_STATE_FOCUSED,
        _NET_WM_STATE_HIDDEN,

        _NET_WM_ALLOWED_ACTIONS,
        _NET_WM_ACTION_FULLSCREEN,
        _NET_WM_ACTION_MAXIMIZE_HORZ,
        _NET_WM_ACTION_MAXIMIZE_VERT,
        _NET_WM_ACTION_MINIMIZE,

        _MOTIF_WM_HINTS,
    }
}

/// EWMH move/resize directions, in protocol order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum MoveResizeDirection {
    SizeTopLeft = 0,
    SizeTop = 1,
    SizeTopRight = 2,
    SizeRight = 3,
    SizeBottomRight = 4,
    SizeBottom = 5,
    SizeBottomLeft = 6,
    SizeLeft = 7,
    Move = 8,
}

/// A frame-drawn or frame-timings message from the compositing manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameMessage {
    Drawn { id: u64, time_us: u64 },
    Timings { id: u64, refresh_us: u32 },
}

pub struct Xserver {
    pub conn: RustConnection,
    pub screen: xproto::Screen,
    pub atoms: Atoms,

    pub trap: ErrorTrap,
    queued: VecDeque<protocol::Event>,

    time_counter: Option<sync::Counter>,
    overflow_alarms: [sync::Alarm; 2],

    /// Whether the server can present client buffers directly.
    pub has_present: bool,

    synchronize: bool,
}

impl Xserver {
    pub fn connect(synchronize: bool) -> anyhow::Result<Self> {
        let (conn, screen_num) = x11rb::connect(None).context("failed to connect to X server")?;
        let screen = conn.setup().roots[screen_num].clone();

        let atoms = Atoms::new(&conn)?.reply()?;

        conn.sync_initialize(3, 1)
            .context("sync extension unsupported")?
            .reply()?;

        let shape_present = conn
            .extension_information(shape::X11_EXTENSION_NAME)?
            .is_some();
        if !shape_present {
            anyhow::bail!("shape extension unsupported");
        }

        let has_present = conn.extension_information("Present")?.is_some();

        Ok(Self {
            conn,
            screen,
            atoms,

            trap: ErrorTrap::new(),
            queued: VecDeque::new(),

            time_counter: None,
            overflow_alarms: [0, 0],

            has_present,

            synchronize,
        })
    }

    pub fn display_fd(&self) -> BorrowedFd {
        self.conn.stream().as_fd()
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.conn.flush()?;
        Ok(())
    }

    /// Forces a round trip. In synchronous mode this runs after every
    /// dispatch pass, which makes error attribution deterministic when
    /// debugging.
    pub fn round_trip(&mut self) -> anyhow::Result<()> {
        let _ = self.conn.get_input_focus()?.reply()?;
        self.drain_into_queue()?;
        Ok(())
    }

    pub fn maybe_sync(&mut self) -> anyhow::Result<()> {
        if self.synchronize {
            self.round_trip()?;
        }

        Ok(())
    }

    /// The next event, either queued by a trap drain or fresh off the wire.
    pub fn poll_event(&mut self) -> anyhow::Result<Option<protocol::Event>> {
        if let Some(ev) = self.queued.pop_front() {
            return Ok(Some(ev));
        }

        loop {
            match self.conn.poll_for_event()? {
                Some(protocol::Event::Error(err)) if self.trap_filter(&err) => continue,
                other => return Ok(other),
            }
        }
    }

    fn trap_filter(&mut self, err: &X11Error) -> bool {
        self.trap.filter(err)
    }

    fn drain_into_queue(&mut self) -> anyhow::Result<()> {
        while let Some(ev) = self.conn.poll_for_event()? {
            match ev {
                protocol::Event::Error(err) if self.trap.filter(&err) => (),
                other => self.queued.push_back(other),
            }
        }

        Ok(())
    }

    /// Starts capturing errors for the requests issued until `trap_end`.
    pub fn trap_begin(&mut self) -> anyhow::Result<()> {
        let cookie = self.conn.get_input_focus()?;
        self.trap.begin(cookie.sequence_number());
        Ok(())
    }

    /// Synchronizes, then reports the first error the guarded range raised.
    pub fn trap_end(&mut self) -> anyhow::Result<Option<X11Error>> {
        let _ = self.conn.get_input_focus()?.reply()?;
        self.drain_into_queue()?;
        Ok(self.trap.end())
    }

    // Window lifecycle.

    pub fn create_window(&mut self, width: u16, height: u16) -> anyhow::Result<xproto::Window> {
        let window = self.conn.generate_id()?;

        self.conn.create_window(
            self.screen.root_depth,
            window,
            self.screen.root,
            0,
            0,
            width.max(1),
            height.max(1),
            0,
            xproto::WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &xproto::CreateWindowAux::default().event_mask(
                xproto::EventMask::STRUCTURE_NOTIFY | xproto::EventMask::PROPERTY_CHANGE,
            ),
        )?;

        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms.WM_PROTOCOLS,
            xproto::AtomEnum::ATOM,
            &[
                self.atoms.WM_DELETE_WINDOW,
                self.atoms._NET_WM_PING,
                self.atoms._NET_WM_SYNC_REQUEST,
            ],
        )?;

        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._NET_WM_PID,
            xproto::AtomEnum::CARDINAL,
            &[std::process::id()],
        )?;

        let host = nix::unistd::gethostname().unwrap_or_default();
        self.conn.change_property8(
            xproto::PropMode::REPLACE,
            window,
            self.atoms.WM_CLIENT_MACHINE,
            xproto::AtomEnum::STRING,
            host.as_encoded_bytes(),
        )?;

        trace!(window, "created server window");

        Ok(window)
    }

    pub fn destroy_window(&mut self, window: xproto::Window) -> anyhow::Result<()> {
        self.conn.destroy_window(window)?;
        Ok(())
    }

    pub fn map_window(&mut self, window: xproto::Window) -> anyhow::Result<()> {
        self.conn.map_window(window)?;
        self.conn.flush()?;
        Ok(())
    }

    pub fn unmap_window(&mut self, window: xproto::Window) -> anyhow::Result<()> {
        self.conn.unmap_window(window)?;
        self.conn.flush()?;
        Ok(())
    }

    pub fn resize_window(
        &mut self,
        window: xproto::Window,
        width: u16,
        height: u16,
    ) -> anyhow::Result<()> {
        self.conn.configure_window(
            window,
            &xproto::ConfigureWindowAux::default()
                .width(width.max(1) as u32)
                .height(height.max(1) as u32),
        )?;
        Ok(())
    }

    pub fn move_resize_window(
        &mut self,
        window: xproto::Window,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
    ) -> anyhow::Result<()> {
        self.conn.configure_window(
            window,
            &xproto::ConfigureWindowAux::default()
                .x(x)
                .y(y)
                .width(width.max(1) as u32)
                .height(height.max(1) as u32),
        )?;
        Ok(())
    }

    // Properties.

    pub fn set_title(&mut self, window: xproto::Window, title: &str) -> anyhow::Result<()> {
        let utf8 = title.as_bytes();
        let utf8 = &utf8[..utf8.len().min(TEXT_PROPERTY_LIMIT)];
        self.conn.change_property8(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._NET_WM_NAME,
            self.atoms.UTF8_STRING,
            utf8,
        )?;

        // Pre-EWMH clients of the window manager read the legacy name.
        let legacy = latin1::downconvert(title, TEXT_PROPERTY_LIMIT);
        self.conn.change_property8(
            xproto::PropMode::REPLACE,
            window,
            xproto::AtomEnum::WM_NAME,
            xproto::AtomEnum::STRING,
            &legacy,
        )?;

        Ok(())
    }

    pub fn set_class(&mut self, window: xproto::Window, app_id: &str) -> anyhow::Result<()> {
        // Instance and class, both NUL-terminated.
        let mut value = Vec::with_capacity(app_id.len() * 2 + 2);
        value.extend_from_slice(app_id.as_bytes());
        value.push(0);
        value.extend_from_slice(app_id.as_bytes());
        value.push(0);

        self.conn.change_property8(
            xproto::PropMode::REPLACE,
            window,
            xproto::AtomEnum::WM_CLASS,
            xproto::AtomEnum::STRING,
            &value,
        )?;

        Ok(())
    }

    pub fn set_opaque_region(
        &mut self,
        window: xproto::Window,
        region: &Region,
    ) -> anyhow::Result<()> {
        let mut values = Vec::with_capacity(region.rects().len() * 4);
        for rect in region.rects() {
            values.extend_from_slice(&[
                rect.x as u32,
                rect.y as u32,
                rect.width as u32,
                rect.height as u32,
            ]);
        }

        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._NET_WM_OPAQUE_REGION,
            xproto::AtomEnum::CARDINAL,
            &values,
        )?;

        Ok(())
    }

    pub fn set_input_shape(
        &mut self,
        window: xproto::Window,
        region: &Region,
    ) -> anyhow::Result<()> {
        let rects: Vec<xproto::Rectangle> = region
            .rects()
            .iter()
            .map(|r| xproto::Rectangle {
                x: r.x.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                y: r.y.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                width: r.width.clamp(0, u16::MAX as i32) as u16,
                height: r.height.clamp(0, u16::MAX as i32) as u16,
            })
            .collect();

        shape::ConnectionExt::shape_rectangles(
            &self.conn,
            shape::SO::SET,
            shape::SK::INPUT,
            xproto::ClipOrdering::UNSORTED,
            window,
            0,
            0,
            &rects,
        )?;

        Ok(())
    }

    pub fn clear_input_shape(&mut self, window: xproto::Window) -> anyhow::Result<()> {
        shape::ConnectionExt::shape_mask(
            &self.conn,
            shape::SO::SET,
            shape::SK::INPUT,
            window,
            0,
            0,
            x11rb::NONE,
        )?;

        Ok(())
    }

    /// Motif hints carry the decoration choice to the window manager.
    pub fn set_motif_hints(
        &mut self,
        window: xproto::Window,
        decorated: bool,
    ) -> anyhow::Result<()> {
        const MWM_HINTS_DECORATIONS: u32 = 1 << 1;
        let hints = [MWM_HINTS_DECORATIONS, 0, decorated as u32, 0, 0];

        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._MOTIF_WM_HINTS,
            self.atoms._MOTIF_WM_HINTS,
            &hints,
        )?;

        Ok(())
    }

    /// 0 lets the compositing manager unredirect the window; 2 forbids it.
    pub fn set_bypass_compositor(
        &mut self,
        window: xproto::Window,
        value: u32,
    ) -> anyhow::Result<()> {
        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._NET_WM_BYPASS_COMPOSITOR,
            xproto::AtomEnum::CARDINAL,
            &[value],
        )?;

        Ok(())
    }

    pub fn set_size_hints(
        &mut self,
        window: xproto::Window,
        size: Option<(i32, i32)>,
        min_size: Option<(i32, i32)>,
        max_size: Option<(i32, i32)>,
        increment: Option<(i32, i32)>,
    ) -> anyhow::Result<()> {
        let mut hints = x11rb::properties::WmSizeHints::new();
        hints.size = size.map(|s| {
            (
                x11rb::properties::WmSizeHintsSpecification::ProgramSpecified,
                s.0,
                s.1,
            )
        });
        hints.min_size = min_size;
        hints.max_size = max_size;
        hints.size_increment = increment;

        hints.set_normal_hints(&self.conn, window)?;
        Ok(())
    }

    /// Publishes the left/right/top/bottom margins between the window
    /// geometry and the full surface, for client-side decorations.
    pub fn set_frame_extents(
        &mut self,
        window: xproto::Window,
        extents: [u32; 4],
    ) -> anyhow::Result<()> {
        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._NET_FRAME_EXTENTS,
            xproto::AtomEnum::CARDINAL,
            &extents,
        )?;

        Ok(())
    }

    pub fn read_net_wm_state(
        &mut self,
        window: xproto::Window,
    ) -> anyhow::Result<hashbrown::HashSet<xproto::Atom>> {
        let reply = self
            .conn
            .get_property(
                false,
                window,
                self.atoms._NET_WM_STATE,
                xproto::AtomEnum::ATOM,
                0,
                1024,
            )?
            .reply_unchecked()?;

        Ok(reply
            .and_then(|r| r.value32().map(|v| v.collect()))
            .unwrap_or_default())
    }

    pub fn read_allowed_actions(
        &mut self,
        window: xproto::Window,
    ) -> anyhow::Result<hashbrown::HashSet<xproto::Atom>> {
        let reply = self
            .conn
            .get_property(
                false,
                window,
                self.atoms._NET_WM_ALLOWED_ACTIONS,
                xproto::AtomEnum::ATOM,
                0,
                1024,
            )?
            .reply_unchecked()?;

        Ok(reply
            .and_then(|r| r.value32().map(|v| v.collect()))
            .unwrap_or_default())
    }

    // Client messages to the window manager.

    fn send_to_root(&mut self, event: xproto::ClientMessageEvent) -> anyhow::Result<()> {
        self.conn.send_event(
            false,
            self.screen.root,
            xproto::EventMask::SUBSTRUCTURE_REDIRECT | xproto::EventMask::SUBSTRUCTURE_NOTIFY,
            event,
        )?;

        Ok(())
    }

    /// Asks the window manager to add or remove up to two `_NET_WM_STATE`
    /// atoms. The result arrives later as a property notify.
    pub fn request_wm_state(
        &mut self,
        window: xproto::Window,
        add: bool,
        first: xproto::Atom,
        second: xproto::Atom,
    ) -> anyhow::Result<()> {
        const SOURCE_APPLICATION: u32 = 1;
        let event = xproto::ClientMessageEvent::new(
            32,
            window,
            self.atoms._NET_WM_STATE,
            [add as u32, first, second, SOURCE_APPLICATION, 0],
        );

        self.send_to_root(event)
    }

    pub fn request_minimize(&mut self, window: xproto::Window) -> anyhow::Result<()> {
        const ICONIC_STATE: u32 = 3;
        let event = xproto::ClientMessageEvent::new(
            32,
            window,
            self.atoms.WM_CHANGE_STATE,
            [ICONIC_STATE, 0, 0, 0, 0],
        );

        self.send_to_root(event)
    }

    pub fn request_move_resize(
        &mut self,
        window: xproto::Window,
        direction: MoveResizeDirection,
    ) -> anyhow::Result<()> {
        const SOURCE_APPLICATION: u32 = 1;
        let event = xproto::ClientMessageEvent::new(
            32,
            window,
            self.atoms._NET_WM_MOVERESIZE,
            [0, 0, direction as u32, 0, SOURCE_APPLICATION],
        );

        self.send_to_root(event)
    }

    /// Echoes a `_NET_WM_PING` back to the window manager.
    pub fn reply_ping(&mut self, window: xproto::Window, timestamp: u32) -> anyhow::Result<()> {
        let event = xproto::ClientMessageEvent::new(
            32,
            self.screen.root,
            self.atoms.WM_PROTOCOLS,
            [self.atoms._NET_WM_PING, timestamp, window, 0, 0],
        );

        self.send_to_root(event)
    }

    // Sync counters and alarms.

    /// Creates the pair of counters for extended frame synchronization and
    /// publishes them on the window.
    pub fn create_frame_counters(
        &mut self,
        window: xproto::Window,
    ) -> anyhow::Result<[sync::Counter; 2]> {
        let basic = self.conn.generate_id()?;
        let extended = self.conn.generate_id()?;

        let zero = sync::Int64 { hi: 0, lo: 0 };
        self.conn.sync_create_counter(basic, zero)?;
        self.conn.sync_create_counter(extended, zero)?;

        self.conn.change_property32(
            xproto::PropMode::REPLACE,
            window,
            self.atoms._NET_WM_SYNC_REQUEST_COUNTER,
            xproto::AtomEnum::CARDINAL,
            &[basic, extended],
        )?;

        Ok([basic, extended])
    }

    pub fn destroy_frame_counters(&mut self, counters: [sync::Counter; 2]) -> anyhow::Result<()> {
        for counter in counters {
            self.conn.sync_destroy_counter(counter)?;
        }

        Ok(())
    }

    pub fn set_counter(&mut self, counter: sync::Counter, value: u64) -> anyhow::Result<()> {
        let value = sync::Int64 {
            hi: (value >> 32) as i32,
            lo: (value & 0xFFFF_FFFF) as u32,
        };
        self.conn.sync_set_counter(counter, value)?;

        Ok(())
    }

    /// Locates the server's time counter and programs the overflow alarm
    /// pair. Must be called once at startup.
    pub fn init_time_alarms(&mut self, clock: &mut Clock) -> anyhow::Result<()> {
        let counters = self.conn.sync_list_system_counters()?.reply()?;
        let counter = counters
            .counters
            .iter()
            .find(|c| c.name == b"SERVERTIME")
            .map(|c| c.counter)
            .context("server has no SERVERTIME counter")?;

        self.time_counter = Some(counter);

        let value = self.conn.sync_query_counter(counter)?.reply()?;
        let now = int64_to_u64(value.counter_value);
        clock.from_server_time(now as u32);

        for i in 0..2 {
            self.overflow_alarms[i] = self.conn.generate_id()?;
        }

        let [first, second] = self.alarm_targets(now, clock);
        for (alarm, target) in self.overflow_alarms.into_iter().zip([first, second]) {
            self.conn.sync_create_alarm(
                alarm,
                &sync::CreateAlarmAux::new()
                    .counter(counter)
                    .value_type(sync::VALUETYPE::ABSOLUTE)
                    .value(u64_to_int64(target))
                    .test_type(sync::TESTTYPE::POSITIVE_COMPARISON)
                    .events(1),
            )?;
        }

        self.conn.flush()?;
        debug!(counter, "programmed time overflow alarms");

        Ok(())
    }

    /// The next two absolute counter values the alarms should fire at,
    /// derived from the clock's 32-bit boundaries.
    fn alarm_targets(&self, now: u64, clock: &Clock) -> [u64; 2] {
        let base = now & !0xFFFF_FFFF;
        clock.alarm_boundaries().map(|b| {
            let mut target = base | b as u64;
            while target <= now {
                target += 1 << 31;
            }
            target
        })
    }

    /// Handles an alarm notify: feeds the observed counter value to the
    /// clock and reprograms both alarms for the next boundaries.
    pub fn handle_alarm(
        &mut self,
        event: &sync::AlarmNotifyEvent,
        clock: &mut Clock,
    ) -> anyhow::Result<bool> {
        if self.time_counter.is_none() || !self.overflow_alarms.contains(&event.alarm) {
            return Ok(false);
        }

        let now = int64_to_u64(event.counter_value);
        clock.note_alarm(now as u32);

        let [first, second] = self.alarm_targets(now, clock);
        for (alarm, target) in self.overflow_alarms.into_iter().zip([first, second]) {
            self.conn.sync_change_alarm(
                alarm,
                &sync::ChangeAlarmAux::new().value(u64_to_int64(target)),
            )?;
        }

        trace!(now, "time overflow alarm");

        Ok(true)
    }

    /// Decodes a compositing-manager frame message, if this is one. The id
    /// rides in the first two longs, low half first.
    pub fn parse_frame_message(&self, msg: &xproto::ClientMessageEvent) -> Option<FrameMessage> {
        let data = msg.data.as_data32();
        let id = data[0] as u64 | ((data[1] as u64) << 32);

        if msg.type_ == self.atoms._NET_WM_FRAME_DRAWN {
            let time_us = data[2] as u64 | ((data[3] as u64) << 32);
            Some(FrameMessage::Drawn { id, time_us })
        } else if msg.type_ == self.atoms._NET_WM_FRAME_TIMINGS {
            Some(FrameMessage::Timings {
                id,
                refresh_us: data[3],
            })
        } else {
            None
        }
    }
}

fn int64_to_u64(v: sync::Int64) -> u64 {
    ((v.hi as u64) << 32) | v.lo as u64
}

fn u64_to_int64(v: u64) -> sync::Int64 {
    sync::Int64 {
        hi: (v >> 32) as i32,
        lo: (v & 0xFFFF_FFFF) as u32,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int64_round_trip() {
        for v in [0_u64, 1, 0xFFFF_FFFF, 0x1_0000_0000, u64::MAX / 2] {
            assert_eq!(int64_to_u64(u64_to_int64(v)), v);
        }
    }
}
