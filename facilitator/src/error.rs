use std::{error::Error, fmt, io};

use comms::msg::{MsgKind, Rank};

use crate::{session::Phase, trainer::TrainErr};

/// The facilitator module's result type.
pub type Result<T> = std::result::Result<T, FacilitatorErr>;

/// The precondition an inbound message failed to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// The session already finished, nothing else is accepted.
    Finished,
    /// The message is addressed to another rank.
    Misaddressed { receiver: Rank },
    /// The kind only travels away from the facilitator.
    OutboundKind,
    /// The sender isn't allowed to send this kind.
    UnexpectedSender,
    /// The session is not in the phase this kind requires.
    WrongPhase { expected: Phase },
    /// Gradients arrived with no forward pass bound to a client.
    NoBoundClient,
    /// The parameters don't match the kind.
    MalformedPayload,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Finished => f.write_str("the protocol already finished"),
            Violation::Misaddressed { receiver } => {
                write!(f, "message is addressed to rank {receiver}")
            }
            Violation::OutboundKind => f.write_str("kind is never sent to the facilitator"),
            Violation::UnexpectedSender => f.write_str("sender may not send this kind"),
            Violation::WrongPhase { expected } => write!(f, "requires the {expected} phase"),
            Violation::NoBoundClient => f.write_str("no client is bound to a forward pass"),
            Violation::MalformedPayload => f.write_str("parameters don't match the kind"),
        }
    }
}

/// Facilitator runtime failures.
#[derive(Debug)]
pub enum FacilitatorErr {
    ProtocolViolation {
        kind: MsgKind,
        sender: Rank,
        phase: Phase,
        violation: Violation,
    },
    Transport(io::Error),
    Compute {
        kind: MsgKind,
        source: TrainErr,
    },
    MissingHandler(MsgKind),
    DuplicateHandler(MsgKind),
    NotInbound(MsgKind),
    InvalidConfig(String),
}

impl FacilitatorErr {
    /// Returns the violated precondition if this is a protocol violation.
    pub fn violation(&self) -> Option<Violation> {
        match self {
            FacilitatorErr::ProtocolViolation { violation, .. } => Some(*violation),
            _ => None,
        }
    }
}

impl fmt::Display for FacilitatorErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacilitatorErr::ProtocolViolation {
                kind,
                sender,
                phase,
                violation,
            } => write!(
                f,
                "protocol violation: {kind} from rank {sender} during {phase}: {violation}"
            ),
            FacilitatorErr::Transport(e) => write!(f, "transport failure: {e}"),
            FacilitatorErr::Compute { kind, source } => {
                write!(f, "compute failure handling {kind}: {source}")
            }
            FacilitatorErr::MissingHandler(kind) => write!(f, "no handler registered for {kind}"),
            FacilitatorErr::DuplicateHandler(kind) => {
                write!(f, "a handler for {kind} is already registered")
            }
            FacilitatorErr::NotInbound(kind) => {
                write!(f, "{kind} is not an inbound kind, it can't have a handler")
            }
            FacilitatorErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for FacilitatorErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FacilitatorErr::Transport(e) => Some(e),
            FacilitatorErr::Compute { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for FacilitatorErr {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<FacilitatorErr> for io::Error {
    fn from(value: FacilitatorErr) -> Self {
        match value {
            FacilitatorErr::Transport(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
