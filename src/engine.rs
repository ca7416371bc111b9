use core::fmt;

use embassy_time::Duration;

/// The line-oriented command/response engine the driver talks through.
///
/// The engine owns the serial link and the lexical layer of the AT protocol:
/// it formats outgoing command lines, matches incoming lines and watches for
/// unsolicited text. The driver never sees raw serial traffic outside of
/// [AtEngine::write] and the reads an out-of-band handler performs through
/// [OobIo].
///
/// All blocking calls are governed by the timeout set with
/// [AtEngine::set_timeout] and can be cancelled by [OobIo::abort] from within
/// a nested out-of-band handler.
pub trait AtEngine {
    /// Register an unsolicited-text prefix.
    ///
    /// Whenever text starting with `prefix` arrives outside of the currently
    /// awaited response, including in the middle of a [recv](AtEngine::recv)
    /// wait, the engine must hand it to the [OobHandler] passed into the
    /// blocking call that observed it.
    fn oob(&mut self, prefix: &'static str);
    /// Format and transmit a single command line.
    fn send(&mut self, command: fmt::Arguments<'_>) -> bool;
    /// Block until a line accepted by `matcher` arrives.
    ///
    /// Non-matching unsolicited lines with a registered prefix are dispatched
    /// to `handlers` mid-wait; other non-matching lines are discarded. Returns
    /// `false` on timeout or when the wait was aborted from a handler.
    fn recv(
        &mut self,
        handlers: &mut dyn OobHandler,
        matcher: &mut dyn FnMut(&str) -> bool,
    ) -> bool;
    /// Transmit raw payload bytes. Returns the number of bytes written.
    fn write(&mut self, data: &[u8]) -> Option<usize>;
    /// Single non-blocking poll for pending unsolicited input.
    ///
    /// Returns whether anything was dispatched. Callers drain pending events
    /// by looping until this returns `false`.
    fn process_oob(&mut self, handlers: &mut dyn OobHandler) -> bool;
    /// Set the timeout for subsequent blocking waits.
    fn set_timeout(&mut self, timeout: Duration);
    /// Whether the serial link has data pending.
    fn readable(&self) -> bool;
    /// Whether the serial link can accept data.
    fn writable(&self) -> bool;
    /// Attach a callback to the serial readiness edge, or detach with `None`.
    fn attach(&mut self, callback: Option<fn()>);
}

/// Dispatch target for unsolicited text.
///
/// Handlers run nested inside the engine call that observed the text, on the
/// thread already holding the channel lock. They get the narrowed [OobIo]
/// view of the engine and must not attempt to re-enter the driver.
pub trait OobHandler {
    /// Called with the registered `prefix` that matched. The remainder of the
    /// announcement is read through `io`.
    fn on_oob(&mut self, prefix: &str, io: &mut dyn OobIo);
}

/// The slice of the engine an out-of-band handler is allowed to use.
pub trait OobIo {
    /// Blocking read of announcement text up to and including `terminator`.
    ///
    /// The terminator is consumed but not stored. A line ending counts as a
    /// terminator as well, since announcements never span lines. Returns the
    /// number of bytes placed in `buf`, or `None` on timeout or if the text
    /// does not fit.
    fn read_until(&mut self, terminator: u8, buf: &mut [u8]) -> Option<usize>;
    /// Blocking read of exactly `buf.len()` raw bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> bool;
    /// Cancel the blocking wait the surrounding transaction is parked on.
    ///
    /// The pending [AtEngine::recv] returns `false` promptly instead of
    /// running out its timeout.
    fn abort(&mut self);
}
