use core::{cell::RefCell, fmt};

use embassy_sync::blocking_mutex;
use embassy_time::Duration;
use heapless::String;
use macro_bits::serializable_enum;

use crate::{
    engine::{AtEngine, OobHandler, OobIo},
    packet_queue::PacketQueue,
    parse, DefaultRawMutex,
};

/// Number of logical connections the module multiplexes over the channel.
pub const LINK_COUNT: usize = 5;

/// Prefix of an inbound-data announcement.
const INBOUND_DATA_PREFIX: &str = "+IPD";
/// Prefix of an asynchronous join-status report.
///
/// Espressif's AT command document says this should be `+CWJAP_CUR:<code>`,
/// but at least current firmware sends `+CWJAP:<code>`, and `FAIL` instead of
/// `ERROR`.
const JOIN_STATUS_PREFIX: &str = "+CWJAP:";

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    /// Operating mode of the module.
    pub enum WifiMode: u8 {
        #[default]
        Station => 1,
        SoftAp => 2,
        StationSoftAp => 3
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
    /// The interface a DHCP setting applies to.
    pub enum DhcpMode: u8 {
        #[default]
        Station => 1,
        SoftAp => 0,
        Both => 2
    }
}

/// Security mode of an access point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecurityMode {
    #[default]
    Open,
    Wep,
    WpaPsk,
    Wpa2Psk,
    WpaWpa2Psk,
    Wpa2Enterprise,
    Unknown,
}
impl SecurityMode {
    /// Map the `ecn` field of a scan record.
    const fn from_ecn(ecn: i32) -> Self {
        match ecn {
            0 => Self::Open,
            1 => Self::Wep,
            2 => Self::WpaPsk,
            3 => Self::Wpa2Psk,
            4 => Self::WpaWpa2Psk,
            5 => Self::Wpa2Enterprise,
            _ => Self::Unknown,
        }
    }
}

/// Transport type of a logical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionType {
    Tcp,
    Udp,
}
impl ConnectionType {
    const fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

/// One access point seen while scanning. Produced transiently, not retained
/// by the driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String<32>,
    pub security: SecurityMode,
    /// Signal strength in dBm.
    pub rssi: i8,
    pub bssid: [u8; 6],
    pub channel: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinError {
    /// The join attempt timed out (asynchronous failure code 1).
    ConnectionTimeout,
    /// The access point rejected the credentials (code 2).
    AuthFailure,
    /// No access point with that SSID was found (code 3).
    NoSuchNetwork,
    /// The module reported neither success nor a specific failure.
    NoConnection,
}

/// Asynchronous join-failure report.
///
/// Written only by the out-of-band handler, consumed (read and cleared)
/// exactly once by the join attempt it interrupted.
struct JoinLatch {
    failed: bool,
    code: i32,
}
impl JoinLatch {
    const fn new() -> Self {
        Self {
            failed: false,
            code: 0,
        }
    }
    fn clear(&mut self) {
        self.failed = false;
        self.code = 0;
    }
    fn set(&mut self, code: i32) {
        self.failed = true;
        self.code = code;
    }
    /// The latched failure code, if any. Always leaves the latch cleared.
    fn take(&mut self) -> Option<i32> {
        let code = self.failed.then_some(self.code);
        self.clear();
        code
    }
}

/// Shared state the out-of-band handlers mutate.
///
/// Lives next to the engine under the channel lock; handlers run nested on
/// the thread already holding it, so no further locking is needed here.
struct LinkState<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> {
    packets: PacketQueue<BUFFER_SIZE, BUFFER_COUNT>,
    latch: JoinLatch,
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> LinkState<BUFFER_SIZE, BUFFER_COUNT> {
    fn new() -> Self {
        Self {
            packets: PacketQueue::new(),
            latch: JoinLatch::new(),
        }
    }
    /// Handler for inbound-data announcements.
    ///
    /// Parses the announced connection id and byte count, reads exactly that
    /// many raw bytes and appends them to the packet queue. There is no
    /// caller to report failures to, so anything that cannot be buffered is
    /// drained off the wire and dropped.
    fn on_inbound_data(&mut self, io: &mut dyn OobIo) {
        let mut header = [0u8; 24];
        let Some(n) = io.read_until(b':', &mut header) else {
            return;
        };
        let Some((link_id, len)) = core::str::from_utf8(&header[..n])
            .ok()
            .and_then(parse::inbound_header)
        else {
            return;
        };
        if link_id >= LINK_COUNT || len > BUFFER_SIZE {
            warn!("Dropping {} byte payload for link {}.", len, link_id);
            discard_payload(io, len);
            return;
        }
        let Some(slot) = self.packets.alloc() else {
            warn!("Packet queue full. Dropping {} bytes for link {}.", len, link_id);
            discard_payload(io, len);
            return;
        };
        if io.read_exact(&mut self.packets.buffer_mut(slot)[..len]) {
            self.packets.commit(slot, link_id, len);
        } else {
            self.packets.release(slot);
        }
    }
    /// Handler for asynchronous join-status reports.
    fn on_join_status(&mut self, io: &mut dyn OobIo) {
        self.latch.clear();
        let mut line = [0u8; 16];
        let Some(n) = io.read_until(b'\n', &mut line) else {
            return;
        };
        let Some(code) = core::str::from_utf8(&line[..n])
            .ok()
            .and_then(parse::leading_int)
        else {
            return;
        };
        let Some(m) = io.read_until(b'\n', &mut line) else {
            return;
        };
        if core::str::from_utf8(&line[..m]).map(str::trim) == Ok("FAIL") {
            debug!("Join failed with code {}.", code);
            self.latch.set(code);
            // The transaction parked on its acknowledgment must return
            // promptly instead of running out its timeout.
            io.abort();
        }
    }
}
impl<const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> OobHandler
    for LinkState<BUFFER_SIZE, BUFFER_COUNT>
{
    fn on_oob(&mut self, prefix: &str, io: &mut dyn OobIo) {
        match prefix {
            INBOUND_DATA_PREFIX => self.on_inbound_data(io),
            JOIN_STATUS_PREFIX => self.on_join_status(io),
            _ => {}
        }
    }
}

/// Drain an unbufferable announced payload so the line stream stays in sync.
fn discard_payload(io: &mut dyn OobIo, mut len: usize) {
    let mut scratch = [0u8; 32];
    while len > 0 {
        let take = len.min(scratch.len());
        if !io.read_exact(&mut scratch[..take]) {
            return;
        }
        len -= take;
    }
}

/// Wait for the module's `OK` acknowledgment.
fn recv_ok<E: AtEngine>(engine: &mut E, handlers: &mut dyn OobHandler) -> bool {
    engine.recv(handlers, &mut |line| line == "OK")
}

/// Single command/response transaction extracting one quoted field.
fn quoted_query<E: AtEngine, const N: usize>(
    engine: &mut E,
    handlers: &mut dyn OobHandler,
    command: fmt::Arguments<'_>,
    prefix: &'static str,
) -> Option<String<N>> {
    let mut value = None;
    let done = engine.send(command)
        && engine.recv(handlers, &mut |line| {
            let Some(rest) = line.strip_prefix(prefix) else {
                return false;
            };
            let Some((field, _)) = parse::quoted_field(rest) else {
                return false;
            };
            value = String::try_from(field).ok();
            true
        })
        && recv_ok(engine, handlers);
    if done {
        value
    } else {
        None
    }
}

/// Parse one scan record: `+CWLAP:(<ecn>,"<ssid>",<rssi>,"<mac>",<channel>)`.
fn parse_ap(line: &str) -> Option<AccessPoint> {
    let rest = line.strip_prefix("+CWLAP:(")?;
    let ecn = parse::leading_int(rest)?;
    let (ssid, rest) = parse::quoted_field(rest)?;
    let rest = rest.strip_prefix(',')?;
    let rssi = parse::leading_int(rest)?;
    let (mac, rest) = parse::quoted_field(rest)?;
    let bssid = parse::mac_address(mac)?;
    let rest = rest.strip_prefix(',')?;
    let channel = parse::leading_int(rest)?;
    Some(AccessPoint {
        ssid: String::try_from(ssid).ok()?,
        security: SecurityMode::from_ecn(ecn),
        rssi: rssi as i8,
        bssid,
        channel: channel as u8,
    })
}

/// Everything that lives under the channel lock.
struct Channel<E, const BUFFER_SIZE: usize, const BUFFER_COUNT: usize> {
    engine: E,
    state: LinkState<BUFFER_SIZE, BUFFER_COUNT>,
}

/// Driver for an ESP8266 module behind a line-oriented command/response
/// engine.
///
/// `BUFFER_SIZE` bounds a single inbound payload (the AT firmware announces
/// at most one TCP segment per notification), `BUFFER_COUNT` the number of
/// payloads that can be queued before announcements get dropped.
///
/// A single lock serializes all channel access: public operations hold it
/// for their full command/response sequence, and the out-of-band handlers
/// run nested inside those waits, never on a thread of their own.
pub struct Esp8266<E: AtEngine, const BUFFER_SIZE: usize = 1460, const BUFFER_COUNT: usize = 8> {
    channel: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Channel<E, BUFFER_SIZE, BUFFER_COUNT>>>,
}
impl<E: AtEngine, const BUFFER_SIZE: usize, const BUFFER_COUNT: usize>
    Esp8266<E, BUFFER_SIZE, BUFFER_COUNT>
{
    /// Take ownership of the engine and register the unsolicited-text
    /// handlers.
    pub fn new(mut engine: E) -> Self {
        engine.oob(INBOUND_DATA_PREFIX);
        engine.oob(JOIN_STATUS_PREFIX);
        Self {
            channel: blocking_mutex::Mutex::new(RefCell::new(Channel {
                engine,
                state: LinkState::new(),
            })),
        }
    }
    /// Check that a connection id is in range.
    pub const fn is_valid_link(link_id: usize) -> bool {
        link_id < LINK_COUNT
    }
    fn with_channel<R>(
        &self,
        f: impl FnOnce(&mut E, &mut LinkState<BUFFER_SIZE, BUFFER_COUNT>) -> R,
    ) -> R {
        self.channel.lock(|channel| {
            let mut channel = channel.borrow_mut();
            let Channel { engine, state } = &mut *channel;
            f(engine, state)
        })
    }
    /// SDK version reported by the module.
    ///
    /// Older firmware versions do not prefix the version with
    /// `SDK version:`, which reports as `None` here.
    pub fn get_firmware_version(&self) -> Option<i32> {
        self.with_channel(|engine, state| {
            let mut version = None;
            let done = engine.send(format_args!("AT+GMR"))
                && engine.recv(state, &mut |line| {
                    match line.strip_prefix("SDK version:").and_then(parse::leading_int) {
                        Some(v) => {
                            version = Some(v);
                            true
                        }
                        None => false,
                    }
                })
                && recv_ok(engine, state);
            if done {
                version
            } else {
                None
            }
        })
    }
    /// Configure the operating mode and enable connection multiplexing.
    ///
    /// Both commands run under one lock; another thread never observes the
    /// mode set but multiplexing still off.
    pub fn startup(&self, mode: WifiMode) -> bool {
        self.with_channel(|engine, state| {
            engine.send(format_args!("AT+CWMODE_CUR={}", mode.into_bits()))
                && recv_ok(engine, state)
                && engine.send(format_args!("AT+CIPMUX=1"))
                && recv_ok(engine, state)
        })
    }
    /// Reset the module. May take a second attempt.
    pub fn reset(&self) -> bool {
        self.with_channel(|engine, state| {
            for _ in 0..2 {
                if engine.send(format_args!("AT+RST"))
                    && recv_ok(engine, state)
                    && engine.recv(state, &mut |line| line == "ready")
                {
                    return true;
                }
            }
            false
        })
    }
    /// Enable or disable DHCP for the given interface.
    pub fn dhcp(&self, enabled: bool, mode: DhcpMode) -> bool {
        self.with_channel(|engine, state| {
            engine.send(format_args!(
                "AT+CWDHCP_CUR={},{}",
                mode.into_bits(),
                enabled as u8
            )) && recv_ok(engine, state)
        })
    }
    /// Join an access point.
    ///
    /// The module's synchronous acknowledgment for a join attempt is
    /// unreliable across firmware versions, so failure is detected from the
    /// asynchronous status report the out-of-band handler latches. A latched
    /// report is consumed on every branch; it must never leak into a later
    /// attempt.
    pub fn join(&self, ssid: &str, passphrase: &str) -> Result<(), JoinError> {
        self.with_channel(|engine, state| {
            engine.send(format_args!(
                "AT+CWJAP_CUR=\"{}\",\"{}\"",
                ssid, passphrase
            ));
            let acknowledged = recv_ok(engine, state);
            let failure = state.latch.take();
            if acknowledged {
                return Ok(());
            }
            Err(match failure {
                Some(1) => JoinError::ConnectionTimeout,
                Some(2) => JoinError::AuthFailure,
                Some(3) => JoinError::NoSuchNetwork,
                _ => JoinError::NoConnection,
            })
        })
    }
    /// Leave the current network.
    pub fn disconnect(&self) -> bool {
        self.with_channel(|engine, state| {
            engine.send(format_args!("AT+CWQAP")) && recv_ok(engine, state)
        })
    }
    /// IP address of the station interface, `None` if the module does not
    /// report one.
    pub fn get_ip_address(&self) -> Option<String<16>> {
        self.with_channel(|engine, state| {
            quoted_query(engine, state, format_args!("AT+CIFSR"), "+CIFSR:STAIP,")
        })
    }
    /// Hardware address of the station interface.
    pub fn get_mac_address(&self) -> Option<String<18>> {
        self.with_channel(|engine, state| {
            quoted_query(engine, state, format_args!("AT+CIFSR"), "+CIFSR:STAMAC,")
        })
    }
    /// Gateway of the station interface.
    pub fn get_gateway(&self) -> Option<String<16>> {
        self.with_channel(|engine, state| {
            quoted_query(
                engine,
                state,
                format_args!("AT+CIPSTA_CUR?"),
                "+CIPSTA_CUR:gateway:",
            )
        })
    }
    /// Netmask of the station interface.
    pub fn get_netmask(&self) -> Option<String<16>> {
        self.with_channel(|engine, state| {
            quoted_query(
                engine,
                state,
                format_args!("AT+CIPSTA_CUR?"),
                "+CIPSTA_CUR:netmask:",
            )
        })
    }
    /// Signal strength of the joined access point, 0 when unavailable.
    ///
    /// The module has no direct query for this; the joined BSSID is resolved
    /// first and the scan list is then filtered by it, as two separate
    /// transactions.
    pub fn get_rssi(&self) -> i8 {
        let bssid = self.with_channel(|engine, state| {
            let mut bssid: Option<String<17>> = None;
            let done = engine.send(format_args!("AT+CWJAP_CUR?"))
                && engine.recv(state, &mut |line| {
                    let Some(rest) = line.strip_prefix("+CWJAP_CUR:") else {
                        return false;
                    };
                    let Some((_, rest)) = parse::quoted_field(rest) else {
                        return false;
                    };
                    let Some((mac, _)) = parse::quoted_field(rest) else {
                        return false;
                    };
                    bssid = String::try_from(mac).ok();
                    bssid.is_some()
                })
                && recv_ok(engine, state);
            if done {
                bssid
            } else {
                None
            }
        });
        let Some(bssid) = bssid else {
            return 0;
        };
        self.with_channel(|engine, state| {
            let mut rssi = None;
            let done = engine.send(format_args!("AT+CWLAP=\"\",\"{}\",", bssid))
                && engine.recv(state, &mut |line| match parse_ap(line) {
                    Some(ap) => {
                        rssi = Some(ap.rssi);
                        true
                    }
                    None => false,
                })
                && recv_ok(engine, state);
            if done {
                rssi.unwrap_or(0)
            } else {
                0
            }
        })
    }
    /// Scan for access points.
    ///
    /// Every record the module reports is consumed and counted; the first
    /// `out.len()` of them are copied into `out`. The return value is the
    /// number seen, `None` if the scan could not be started.
    pub fn scan(&self, out: &mut [AccessPoint]) -> Option<usize> {
        self.with_channel(|engine, state| {
            if !engine.send(format_args!("AT+CWLAP")) {
                return None;
            }
            let mut seen = 0;
            loop {
                let mut record = None;
                let matched = engine.recv(state, &mut |line| match parse_ap(line) {
                    Some(ap) => {
                        record = Some(ap);
                        true
                    }
                    None => false,
                });
                let Some(ap) = matched.then_some(record).flatten() else {
                    break;
                };
                if let Some(slot) = out.get_mut(seen) {
                    *slot = ap;
                }
                seen += 1;
            }
            trace!("Scan found {} access points.", seen);
            Some(seen)
        })
    }
    /// Open a logical connection.
    pub fn open(
        &self,
        connection_type: ConnectionType,
        link_id: usize,
        address: &str,
        port: u16,
    ) -> bool {
        // IDs only 0-4.
        if !Self::is_valid_link(link_id) {
            return false;
        }
        self.with_channel(|engine, state| {
            engine.send(format_args!(
                "AT+CIPSTART={},\"{}\",\"{}\",{}",
                link_id,
                connection_type.as_str(),
                address,
                port
            )) && recv_ok(engine, state)
        })
    }
    /// Send payload bytes over an open connection.
    ///
    /// May take a second attempt if the module is busy. Every attempt
    /// restarts from the length header.
    pub fn send(&self, link_id: usize, data: &[u8]) -> bool {
        for _ in 0..2 {
            let done = self.with_channel(|engine, state| {
                engine.send(format_args!("AT+CIPSEND={},{}", link_id, data.len()))
                    && engine.recv(state, &mut |line| line.starts_with('>'))
                    && engine.write(data) == Some(data.len())
            });
            if done {
                return true;
            }
        }
        false
    }
    /// Read received bytes for a connection.
    ///
    /// Returns `None` when nothing is queued for `link_id`, without
    /// blocking, even when other connections have data. A queued packet
    /// larger than `data` is consumed incrementally across calls.
    pub fn recv(&self, link_id: usize, data: &mut [u8]) -> Option<usize> {
        self.with_channel(|engine, state| {
            // Data may already have arrived on the wire without a wait
            // having surfaced it yet.
            while engine.process_oob(state) {}
            state.packets.pop_front(link_id, data)
        })
    }
    /// Close a logical connection. May take a second attempt.
    pub fn close(&self, link_id: usize) -> bool {
        for _ in 0..2 {
            let done = self.with_channel(|engine, state| {
                let done = engine.send(format_args!("AT+CIPCLOSE={}", link_id))
                    && recv_ok(engine, state);
                if done {
                    // Packets still queued for this id must not leak into a
                    // later connection reusing it.
                    state.packets.purge(link_id);
                }
                done
            });
            if done {
                return true;
            }
        }
        false
    }
    /// Resolve a hostname through the module.
    pub fn dns_lookup(&self, name: &str) -> Option<String<16>> {
        self.with_channel(|engine, state| {
            let mut ip = None;
            let done = engine.send(format_args!("AT+CIPDOMAIN=\"{}\"", name))
                && engine.recv(state, &mut |line| match line.strip_prefix("+CIPDOMAIN:") {
                    Some(rest) => {
                        ip = String::try_from(rest.trim()).ok();
                        true
                    }
                    None => false,
                });
            if done {
                ip
            } else {
                None
            }
        })
    }
    /// Mode the module boots into.
    pub fn get_default_wifi_mode(&self) -> Option<WifiMode> {
        self.with_channel(|engine, state| {
            let mut mode = None;
            let done = engine.send(format_args!("AT+CWMODE_DEF?"))
                && engine.recv(state, &mut |line| {
                    match line.strip_prefix("+CWMODE_DEF:").and_then(parse::leading_int) {
                        Some(1) => mode = Some(WifiMode::Station),
                        Some(2) => mode = Some(WifiMode::SoftAp),
                        Some(3) => mode = Some(WifiMode::StationSoftAp),
                        _ => return false,
                    }
                    true
                })
                && recv_ok(engine, state);
            if done {
                mode
            } else {
                None
            }
        })
    }
    /// Persist the mode the module boots into.
    pub fn set_default_wifi_mode(&self, mode: WifiMode) -> bool {
        self.with_channel(|engine, state| {
            engine.send(format_args!("AT+CWMODE_DEF={}", mode.into_bits()))
                && recv_ok(engine, state)
        })
    }
    /// Timeout for the module's responses.
    pub fn set_timeout(&self, timeout: Duration) {
        self.with_channel(|engine, _| engine.set_timeout(timeout));
    }
    /// Whether the serial link has data pending.
    pub fn readable(&self) -> bool {
        self.with_channel(|engine, _| engine.readable())
    }
    /// Whether the serial link can accept data.
    pub fn writable(&self) -> bool {
        self.with_channel(|engine, _| engine.writable())
    }
    /// Attach a callback to the serial readiness edge, or detach with
    /// `None`.
    pub fn attach(&self, callback: Option<fn()>) {
        self.with_channel(|engine, _| engine.attach(callback));
    }
}
