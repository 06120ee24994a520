//! Transport-independent protocol state machine.
//!
//! A [`Layer`] drives one message exchange through a [`LayerHandler`]. The
//! same contract serves inbound queries (the handler consumes a query, then
//! produces the answer) and outbound single-shot exchanges (the handler
//! produces a request, then consumes the reply). Each callback returns the next
//! state; the layer stores it and exposes it to the driver.
//!
//! ```text
//! Begin -> Produce <-> Consume -> Done | Fail | Noop
//! ```

use crate::arena::Arena;
use crate::wire::{Packet, PacketWriter};

/// Exchange state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    /// Initial state, nothing started
    Begin,
    /// An outbound message must be produced
    Produce,
    /// An inbound message is expected
    Consume,
    /// Exchange finished successfully
    Done,
    /// Exchange failed; `produce` may still emit an error message
    Fail,
    /// Exchange finished with nothing to send
    Noop,
}

impl LayerState {
    /// Whether no further callbacks are expected
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Fail | Self::Noop)
    }
}

/// Behaviour flags attached to one exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerFlags(u8);

impl LayerFlags {
    /// The exchange runs over an already established connection
    pub const REUSED: u8 = 0b0000_0001;
    /// Full zone transfers are not allowed
    pub const NO_AXFR: u8 = 0b0000_0010;
    /// Incremental zone transfers are not allowed
    pub const NO_IXFR: u8 = 0b0000_0100;
    /// Replies must fit the client's advertised payload size
    pub const LIMIT_SIZE: u8 = 0b0000_1000;

    /// Create empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create from raw bits
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Add LIMIT_SIZE flag
    #[must_use]
    pub fn with_limit_size(mut self) -> Self {
        self.0 |= Self::LIMIT_SIZE;
        self
    }

    /// Add NO_AXFR and NO_IXFR flags
    #[must_use]
    pub fn with_no_transfers(mut self) -> Self {
        self.0 |= Self::NO_AXFR | Self::NO_IXFR;
        self
    }

    /// Set the given bits
    pub fn insert(&mut self, bits: u8) {
        self.0 |= bits;
    }

    /// Clear the given bits
    pub fn remove(&mut self, bits: u8) {
        self.0 &= !bits;
    }

    /// Check if all given bits are set
    #[must_use]
    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    /// Check if the connection was reused
    #[must_use]
    pub fn is_reused(self) -> bool {
        self.contains(Self::REUSED)
    }

    /// Check if the reply size is limited
    #[must_use]
    pub fn is_size_limited(self) -> bool {
        self.contains(Self::LIMIT_SIZE)
    }
}

impl std::ops::BitOr for LayerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Exchange context passed to every handler callback
pub struct LayerEnv<'a> {
    /// State before the callback
    pub state: LayerState,
    /// Exchange flags; `begin` may merge in per-exchange flags
    pub flags: &'a mut LayerFlags,
    /// Per-exchange memory, reset after `finish`
    pub arena: &'a mut Arena,
}

/// Direction-specific behaviour plugged into a [`Layer`]
pub trait LayerHandler {
    /// What begins the exchange (query addressing, notification target, ...)
    type Params;

    /// Start an exchange; no I/O is performed
    fn begin(&mut self, env: &mut LayerEnv<'_>, params: Self::Params) -> LayerState;

    /// Write the next outbound message into `out`
    fn produce(&mut self, env: &mut LayerEnv<'_>, out: &mut PacketWriter<'_>) -> LayerState;

    /// Ingest an inbound message
    fn consume(&mut self, env: &mut LayerEnv<'_>, pkt: &Packet<'_>) -> LayerState;

    /// Drop transient state while keeping the exchange open
    fn reset(&mut self, env: &mut LayerEnv<'_>) -> LayerState {
        env.state
    }

    /// Release everything tied to the exchange
    fn finish(&mut self, _env: &mut LayerEnv<'_>) -> LayerState {
        LayerState::Noop
    }
}

/// State machine driving one exchange at a time
pub struct Layer<H: LayerHandler> {
    handler: H,
    state: LayerState,
    flags: LayerFlags,
    arena: Arena,
}

impl<H: LayerHandler> Layer<H> {
    /// Create a layer over `handler` using `arena` for per-exchange memory
    pub fn new(handler: H, arena: Arena) -> Self {
        Self {
            handler,
            state: LayerState::Begin,
            flags: LayerFlags::new(),
            arena,
        }
    }

    fn call<F>(&mut self, f: F) -> LayerState
    where
        F: FnOnce(&mut H, &mut LayerEnv<'_>) -> LayerState,
    {
        let mut env = LayerEnv {
            state: self.state,
            flags: &mut self.flags,
            arena: &mut self.arena,
        };
        self.state = f(&mut self.handler, &mut env);
        self.state
    }

    /// Start an exchange
    pub fn begin(&mut self, params: H::Params) -> LayerState {
        self.state = LayerState::Begin;
        self.call(|h, env| h.begin(env, params))
    }

    /// Produce the next outbound message
    pub fn produce(&mut self, out: &mut PacketWriter<'_>) -> LayerState {
        self.call(|h, env| h.produce(env, out))
    }

    /// Consume an inbound message
    pub fn consume(&mut self, pkt: &Packet<'_>) -> LayerState {
        self.call(|h, env| h.consume(env, pkt))
    }

    /// Reset transient handler state
    pub fn reset(&mut self) -> LayerState {
        self.call(|h, env| h.reset(env))
    }

    /// Finish the exchange and release its arena memory as a unit
    pub fn finish(&mut self) -> LayerState {
        let state = self.call(|h, env| h.finish(env));
        self.arena.reset();
        self.flags = LayerFlags::new();
        state
    }

    /// Whether `produce` must be called again
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, LayerState::Produce | LayerState::Fail)
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LayerState {
        self.state
    }

    /// Current flags
    #[must_use]
    pub fn flags(&self) -> LayerFlags {
        self.flags
    }

    /// Replace the flags for the coming exchange
    pub fn set_flags(&mut self, flags: LayerFlags) {
        self.flags = flags;
    }

    /// Per-exchange arena (used by callers to parse inbound messages)
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// Mutable per-exchange arena
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// Wrapped handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable wrapped handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CLASS_IN, Name, rtype};

    /// Client that sends `rounds` messages before accepting the reply
    struct Echo {
        rounds: usize,
        produced: usize,
    }

    impl LayerHandler for Echo {
        type Params = usize;

        fn begin(&mut self, env: &mut LayerEnv<'_>, rounds: usize) -> LayerState {
            env.flags.insert(LayerFlags::LIMIT_SIZE);
            self.rounds = rounds;
            self.produced = 0;
            LayerState::Produce
        }

        fn produce(&mut self, env: &mut LayerEnv<'_>, out: &mut PacketWriter<'_>) -> LayerState {
            env.arena.copy(b"scratch").unwrap();
            out.set_id(self.produced as u16);
            self.produced += 1;
            if self.produced < self.rounds {
                LayerState::Produce
            } else {
                LayerState::Consume
            }
        }

        fn consume(&mut self, _env: &mut LayerEnv<'_>, pkt: &Packet<'_>) -> LayerState {
            if pkt.qr() {
                LayerState::Done
            } else {
                LayerState::Fail
            }
        }
    }

    fn layer() -> Layer<Echo> {
        Layer::new(
            Echo {
                rounds: 0,
                produced: 0,
            },
            Arena::with_capacity(1024),
        )
    }

    #[test]
    fn test_client_flow() {
        let mut layer = layer();
        assert_eq!(layer.state(), LayerState::Begin);
        assert_eq!(layer.begin(3), LayerState::Produce);
        assert!(layer.flags().is_size_limited());

        let mut buf = [0u8; 512];
        let mut out = PacketWriter::new(&mut buf);
        while layer.is_active() {
            layer.produce(&mut out);
        }
        assert_eq!(layer.state(), LayerState::Consume);
        assert_eq!(layer.handler().produced, 3);

        let mut reply = [0u8; 12];
        reply[2] = 0x80;
        let pkt = Packet::new(&reply);
        assert_eq!(layer.consume(&pkt), LayerState::Done);
        assert!(!layer.is_active());
    }

    #[test]
    fn test_finish_resets_arena_and_flags() {
        let mut layer = layer();
        layer.begin(1);
        let mut buf = [0u8; 64];
        let mut out = PacketWriter::new(&mut buf);
        layer.produce(&mut out);
        assert_eq!(layer.arena().used(), 7);

        assert_eq!(layer.finish(), LayerState::Noop);
        assert_eq!(layer.arena().used(), 0);
        assert_eq!(layer.flags(), LayerFlags::new());
    }

    #[test]
    fn test_fail_is_active() {
        let mut layer = layer();
        layer.begin(1);
        let mut buf = [0u8; 64];
        let mut out = PacketWriter::new(&mut buf);
        out.put_question(Name::root().as_wire(), CLASS_IN, rtype::SOA)
            .unwrap();
        layer.produce(&mut out);

        let query = [0u8; 12];
        let pkt = Packet::new(&query);
        assert_eq!(layer.consume(&pkt), LayerState::Fail);
        assert!(layer.is_active());
        assert!(layer.state().is_terminal());
    }

    #[test]
    fn test_flags() {
        let flags = LayerFlags::new().with_limit_size().with_no_transfers();
        assert!(flags.contains(LayerFlags::NO_AXFR | LayerFlags::NO_IXFR));
        assert!(!flags.is_reused());

        let mut flags = flags | LayerFlags::from_bits(LayerFlags::REUSED);
        assert!(flags.is_reused());
        flags.remove(LayerFlags::REUSED);
        assert!(!flags.is_reused());
    }
}
