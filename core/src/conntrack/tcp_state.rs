//! Coarse TCP connection state.
//!
//! The state machine is an observability aid over the flags seen on tracked
//! packets, not a conformance check: out-of-order packets that match no edge
//! simply do not advance the state.

/// FIN flag bit.
pub const FIN: u8 = 0b0000_0001;
/// SYN flag bit.
pub const SYN: u8 = 0b0000_0010;
/// RST flag bit.
pub const RST: u8 = 0b0000_0100;
/// PSH flag bit.
pub const PSH: u8 = 0b0000_1000;
/// ACK flag bit.
pub const ACK: u8 = 0b0001_0000;
/// URG flag bit.
pub const URG: u8 = 0b0010_0000;

/// Observed TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    New,
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Closed,
}

impl TcpState {
    /// Applies one packet's flags and returns the next state.
    ///
    /// RST closes from any state. All other transitions follow the handshake
    /// and teardown edges; unmatched flag combinations leave the state
    /// unchanged.
    pub fn advance(self, flags: u8) -> TcpState {
        if flags & RST != 0 {
            return TcpState::Closed;
        }
        match self {
            TcpState::New if flags & SYN != 0 && flags & ACK == 0 => TcpState::SynSent,
            TcpState::SynSent if flags & SYN != 0 && flags & ACK != 0 => TcpState::SynReceived,
            TcpState::SynReceived if flags & ACK != 0 && flags & SYN == 0 => TcpState::Established,
            TcpState::Established if flags & FIN != 0 => TcpState::FinWait,
            TcpState::FinWait if flags & (FIN | ACK) != 0 => TcpState::Closed,
            other => other,
        }
    }

    /// Wire representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::New => "NEW",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::Closed => "CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_reaches_established() {
        let state = TcpState::New
            .advance(SYN)
            .advance(SYN | ACK)
            .advance(ACK);
        assert_eq!(state, TcpState::Established);
    }

    #[test]
    fn rst_closes_from_any_state() {
        for state in [
            TcpState::New,
            TcpState::SynSent,
            TcpState::SynReceived,
            TcpState::Established,
            TcpState::FinWait,
            TcpState::Closed,
        ] {
            assert_eq!(state.advance(RST | ACK), TcpState::Closed);
        }
    }

    #[test]
    fn teardown_via_fin() {
        let state = TcpState::Established.advance(FIN | ACK);
        assert_eq!(state, TcpState::FinWait);
        assert_eq!(state.advance(ACK), TcpState::Closed);
    }

    #[test]
    fn unmatched_flags_do_not_advance() {
        assert_eq!(TcpState::New.advance(ACK), TcpState::New);
        assert_eq!(TcpState::New.advance(PSH | URG), TcpState::New);
        assert_eq!(TcpState::SynSent.advance(SYN), TcpState::SynSent);
        assert_eq!(TcpState::SynReceived.advance(SYN | ACK), TcpState::SynReceived);
    }
}
