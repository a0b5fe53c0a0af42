use std::{borrow::Cow, fmt, io};

use crate::{
    Deserialize, Serialize,
    codec::{Reader, WORD_SIZE, invalid_data, put_u32},
};

/// Identity of a process within the communication group.
pub type Rank = u32;

type Header = u32;

/// The message type tags of the split learning protocol.
///
/// The prefix names the direction: `C2f` client to facilitator, `S2f` server to
/// facilitator, `F2s` facilitator to server and `F2c` facilitator to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgKind {
    C2fSendActs,
    S2fGrads,
    C2fValidationMode,
    C2fValidationOver,
    C2fProtocolFinished,
    F2sSendActs,
    F2cGrads,
    F2sValidationMode,
    F2sValidationOver,
    F2sProtocolFinished,
}

impl MsgKind {
    /// Every kind, in wire tag order.
    pub const ALL: [MsgKind; 10] = [
        MsgKind::C2fSendActs,
        MsgKind::S2fGrads,
        MsgKind::C2fValidationMode,
        MsgKind::C2fValidationOver,
        MsgKind::C2fProtocolFinished,
        MsgKind::F2sSendActs,
        MsgKind::F2cGrads,
        MsgKind::F2sValidationMode,
        MsgKind::F2sValidationOver,
        MsgKind::F2sProtocolFinished,
    ];

    /// The amount of distinct kinds.
    pub const COUNT: usize = Self::ALL.len();

    /// Returns the wire tag of this kind.
    pub fn tag(self) -> Header {
        self as Header
    }

    /// Returns the kind for a wire tag, `None` if the tag is unknown.
    pub fn from_tag(tag: Header) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Dense index of this kind, usable to address fixed size tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The parameter this kind carries, `None` for signal only kinds.
    pub fn param_key(self) -> Option<ParamKey> {
        match self {
            MsgKind::C2fSendActs | MsgKind::F2sSendActs => Some(ParamKey::Acts),
            MsgKind::S2fGrads | MsgKind::F2cGrads => Some(ParamKey::Grads),
            _ => None,
        }
    }

    /// Whether this kind travels towards the facilitator.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            MsgKind::C2fSendActs
                | MsgKind::S2fGrads
                | MsgKind::C2fValidationMode
                | MsgKind::C2fValidationOver
                | MsgKind::C2fProtocolFinished
        )
    }

    /// Whether this kind is sent by a client.
    pub fn is_from_client(self) -> bool {
        self.is_inbound() && self != MsgKind::S2fGrads
    }

    /// The protocol name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            MsgKind::C2fSendActs => "C2F_SEND_ACTS",
            MsgKind::S2fGrads => "S2F_GRADS",
            MsgKind::C2fValidationMode => "C2F_VALIDATION_MODE",
            MsgKind::C2fValidationOver => "C2F_VALIDATION_OVER",
            MsgKind::C2fProtocolFinished => "C2F_PROTOCOL_FINISHED",
            MsgKind::F2sSendActs => "F2S_SEND_ACTS",
            MsgKind::F2cGrads => "F2C_GRADS",
            MsgKind::F2sValidationMode => "F2S_VALIDATION_MODE",
            MsgKind::F2sValidationOver => "F2S_VALIDATION_OVER",
            MsgKind::F2sProtocolFinished => "F2S_PROTOCOL_FINISHED",
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The keys of the parameters a message may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKey {
    Acts,
    Grads,
}

/// A row major matrix of `f32`, either borrowed from a receive buffer or owned.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<'a> {
    rows: usize,
    cols: usize,
    data: Cow<'a, [f32]>,
}

impl<'a> Tensor<'a> {
    /// Creates a new `Tensor`.
    ///
    /// # Arguments
    /// * `rows` - The amount of rows.
    /// * `cols` - The amount of columns.
    /// * `data` - The row major values, must hold exactly `rows * cols` of them.
    ///
    /// # Returns
    /// The tensor or an `InvalidInput` error if the length doesn't match the shape.
    pub fn new(rows: usize, cols: usize, data: impl Into<Cow<'a, [f32]>>) -> io::Result<Self> {
        let data = data.into();

        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "tensor of shape ({rows}, {cols}) can't hold {} values",
                    data.len()
                ),
            ));
        }

        Ok(Self { rows, cols, data })
    }

    /// Creates a single row tensor out of `data`.
    pub fn row(data: impl Into<Cow<'a, [f32]>>) -> Self {
        let data = data.into();
        Self {
            rows: 1,
            cols: data.len(),
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Detaches the tensor from the buffer it may borrow from.
    pub fn into_owned(self) -> Tensor<'static> {
        Tensor {
            rows: self.rows,
            cols: self.cols,
            data: Cow::Owned(self.data.into_owned()),
        }
    }
}

/// The parameters of a `Msg`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    Signal,
    Acts {
        acts: Tensor<'a>,
        rank_info: Cow<'a, [Rank]>,
    },
    Grads(Tensor<'a>),
}

impl Payload<'_> {
    /// The key of the carried parameter, `None` for signals.
    pub fn param_key(&self) -> Option<ParamKey> {
        match self {
            Payload::Signal => None,
            Payload::Acts { .. } => Some(ParamKey::Acts),
            Payload::Grads(_) => Some(ParamKey::Grads),
        }
    }

    fn into_owned(self) -> Payload<'static> {
        match self {
            Payload::Signal => Payload::Signal,
            Payload::Acts { acts, rank_info } => Payload::Acts {
                acts: acts.into_owned(),
                rank_info: Cow::Owned(rank_info.into_owned()),
            },
            Payload::Grads(grads) => Payload::Grads(grads.into_owned()),
        }
    }
}

/// The application layer message of the split learning protocol.
///
/// A message can only be built with a payload matching its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Msg<'a> {
    kind: MsgKind,
    sender: Rank,
    receiver: Rank,
    payload: Payload<'a>,
}

impl<'a> Msg<'a> {
    /// Creates a new `Msg`.
    ///
    /// # Arguments
    /// * `kind` - The message type tag.
    /// * `sender` - The rank of the sending process.
    /// * `receiver` - The rank of the receiving process.
    /// * `payload` - The parameters, must match `kind.param_key()`.
    ///
    /// # Returns
    /// The message or an `InvalidInput` error on a payload mismatch.
    pub fn new(kind: MsgKind, sender: Rank, receiver: Rank, payload: Payload<'a>) -> io::Result<Self> {
        if kind.param_key() != payload.param_key() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{kind} expects {:?} parameters, got {:?}",
                    kind.param_key(),
                    payload.param_key()
                ),
            ));
        }

        Ok(Self {
            kind,
            sender,
            receiver,
            payload,
        })
    }

    /// Creates a message without parameters.
    pub fn signal(kind: MsgKind, sender: Rank, receiver: Rank) -> io::Result<Self> {
        Self::new(kind, sender, receiver, Payload::Signal)
    }

    /// Creates a message carrying activations and their routing metadata.
    pub fn acts(
        kind: MsgKind,
        sender: Rank,
        receiver: Rank,
        acts: Tensor<'a>,
        rank_info: impl Into<Cow<'a, [Rank]>>,
    ) -> io::Result<Self> {
        let rank_info = rank_info.into();
        Self::new(kind, sender, receiver, Payload::Acts { acts, rank_info })
    }

    /// Creates a message carrying gradients.
    pub fn grads(kind: MsgKind, sender: Rank, receiver: Rank, grads: Tensor<'a>) -> io::Result<Self> {
        Self::new(kind, sender, receiver, Payload::Grads(grads))
    }

    pub fn kind(&self) -> MsgKind {
        self.kind
    }

    pub fn sender(&self) -> Rank {
        self.sender
    }

    pub fn receiver(&self) -> Rank {
        self.receiver
    }

    pub fn payload(&self) -> &Payload<'a> {
        &self.payload
    }

    pub fn into_payload(self) -> Payload<'a> {
        self.payload
    }

    /// Detaches the message from the buffer it may borrow from.
    pub fn into_owned(self) -> Msg<'static> {
        Msg {
            kind: self.kind,
            sender: self.sender,
            receiver: self.receiver,
            payload: self.payload.into_owned(),
        }
    }
}

fn put_dims(buf: &mut Vec<u8>, tensor: &Tensor<'_>) {
    put_u32(buf, tensor.rows as u32);
    put_u32(buf, tensor.cols as u32);
}

impl<'a> Serialize<'a> for Msg<'_> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        put_u32(buf, self.kind.tag());
        put_u32(buf, self.sender);
        put_u32(buf, self.receiver);

        match &self.payload {
            Payload::Signal => None,
            Payload::Grads(grads) => {
                put_dims(buf, grads);
                Some(bytemuck::cast_slice(grads.data()))
            }
            Payload::Acts { acts, rank_info } => {
                put_dims(buf, acts);
                put_u32(buf, rank_info.len() as u32);
                buf.extend_from_slice(bytemuck::cast_slice(&rank_info[..]));
                Some(bytemuck::cast_slice(acts.data()))
            }
        }
    }
}

/// Reads a `(rows, cols)` header followed by the rest of the body as tensor data.
fn read_tensor<'a>(reader: &mut Reader<'a>, rows: usize, cols: usize) -> io::Result<Tensor<'a>> {
    let len = reader.rest().len() / size_of::<f32>();
    let data = reader.slice::<f32>(len, "tensor data")?;

    if !reader.rest().is_empty() {
        return Err(invalid_data(format!(
            "tensor data isn't a whole number of f32, {} bytes left over",
            reader.rest().len()
        )));
    }

    Tensor::new(rows, cols, data).map_err(|e| invalid_data(e.to_string()))
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let mut reader = Reader::new(buf);

        let tag = reader.u32("kind")?;
        let kind = MsgKind::from_tag(tag)
            .ok_or_else(|| invalid_data(format!("Received an invalid kind tag {tag}")))?;
        let sender = reader.u32("sender")?;
        let receiver = reader.u32("receiver")?;

        let payload = match kind.param_key() {
            None if reader.rest().is_empty() => Payload::Signal,
            None => {
                return Err(invalid_data(format!(
                    "{kind} carries no parameters but {} trailing bytes were received",
                    reader.rest().len()
                )));
            }
            Some(ParamKey::Grads) => {
                let rows = reader.u32("tensor rows")? as usize;
                let cols = reader.u32("tensor cols")? as usize;
                Payload::Grads(read_tensor(&mut reader, rows, cols)?)
            }
            Some(ParamKey::Acts) => {
                let rows = reader.u32("tensor rows")? as usize;
                let cols = reader.u32("tensor cols")? as usize;
                let len = reader.u32("rank info length")? as usize;
                let rank_info = reader.slice::<Rank>(len, "rank info")?;

                Payload::Acts {
                    acts: read_tensor(&mut reader, rows, cols)?,
                    rank_info: Cow::Borrowed(rank_info),
                }
            }
        };

        Ok(Self {
            kind,
            sender,
            receiver,
            payload,
        })
    }
}

/// First frame a peer sends after connecting, it announces the peer's rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub rank: Rank,
}

impl<'a> Serialize<'a> for Hello {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        put_u32(buf, self.rank);
        None
    }
}

impl<'a> Deserialize<'a> for Hello {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let bytes: [u8; WORD_SIZE] = buf
            .try_into()
            .map_err(|_| invalid_data(format!("hello frame must be 4 bytes, got {}", buf.len())))?;

        Ok(Self {
            rank: Rank::from_be_bytes(bytes),
        })
    }
}
