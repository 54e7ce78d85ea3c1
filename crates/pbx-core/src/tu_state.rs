/// Call state of a telephone unit.
///
/// `OnHook` is the initial state. `BusySignal` and `Error` stick until the
/// unit hangs up; no other operation leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuState {
    OnHook,
    DialTone,
    Ringing,
    RingBack,
    BusySignal,
    Connected,
    Error,
}

impl std::fmt::Display for TuState {
    /// Renders the wire-protocol spelling of the state.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TuState::OnHook => "ON HOOK",
            TuState::DialTone => "DIAL TONE",
            TuState::Ringing => "RINGING",
            TuState::RingBack => "RING BACK",
            TuState::BusySignal => "BUSY SIGNAL",
            TuState::Connected => "CONNECTED",
            TuState::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}
