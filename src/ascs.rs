//! Audio Stream Control Service
//!
//! This service exposes an interface for Audio Stream Endpoints (ASEs),
//! which enables clients to discover, configure, establish and control
//! the ASEs and their associated unicast Audio Streams.
//!
//! Each control-point write carries a list of ASE IDs with per-ASE
//! parameters; the server answers with one control-point notification
//! holding a response entry per submitted ID, then notifies the status
//! of every ASE that changed.

use heapless::Vec;

use crate::error::Error;
use crate::CodecId;

#[cfg(feature = "server")]
pub mod server;

/// Longest accepted Codec_Specific_Configuration value.
pub const MAX_CODEC_CONFIG: usize = 32;
/// Longest accepted metadata value.
pub const MAX_METADATA: usize = 32;
/// Control-point response scratch, owned by the bank (single task).
pub const RSP_BUF_SIZE: usize = 64;
/// ASE status scratch, owned by the bank (single task).
pub const ASE_BUF_SIZE: usize = 64;

/// Direction of an ASE, from the server's point of view.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sink,
    Source,
}

/// ASE Control Point opcodes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AseControlOpcode {
    ConfigCodec = 0x01,
    ConfigQos = 0x02,
    Enable = 0x03,
    ReceiverStartReady = 0x04,
    Disable = 0x05,
    ReceiverStopReady = 0x06,
    UpdateMetadata = 0x07,
    Release = 0x08,
}

impl AseControlOpcode {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::ConfigCodec,
            0x02 => Self::ConfigQos,
            0x03 => Self::Enable,
            0x04 => Self::ReceiverStartReady,
            0x05 => Self::Disable,
            0x06 => Self::ReceiverStopReady,
            0x07 => Self::UpdateMetadata,
            0x08 => Self::Release,
            _ => return None,
        })
    }
}

/// Per-ASE response codes carried in the control-point notification.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ResponseCode {
    Success = 0x00,
    UnsupportedOpcode = 0x01,
    Truncated = 0x02,
    InvalidAseId = 0x03,
    InvalidAseState = 0x04,
    UnsupportedConfig = 0x05,
    RejectedConfig = 0x06,
    InvalidConfig = 0x07,
    UnsupportedMetadata = 0x08,
    InvalidMetadata = 0x09,
    NoMemory = 0x0A,
    Unspecified = 0x0B,
}

/// Which parameter a non-success response refers to.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum ResponseReason {
    #[default]
    None = 0x00,
    Latency = 0x01,
    Phy = 0x02,
    CodecData = 0x03,
    MaxSdu = 0x04,
    SduInterval = 0x05,
    Framing = 0x06,
    PresentationDelay = 0x07,
    Metadata = 0x08,
}

/// `num_ases` value that flags a response carrying no per-ASE entries.
pub const RESPONSE_NO_ASES: u8 = 0xFF;

/// Server QoS capabilities and preferences reported while an ASE sits
/// in the Codec Configured state.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct QosPreferences {
    /// Support for unframed ISOAL PDUs.
    pub framing: u8,
    pub preferred_phy: u8,
    pub preferred_retransmission_number: u8,
    /// Maximum supported Max_Transport_Latency, milliseconds.
    pub max_transport_latency: u16,
    /// Supported Presentation_Delay window, microseconds.
    pub presentation_delay_min: u32,
    pub presentation_delay_max: u32,
    pub preferred_presentation_delay_min: u32,
    pub preferred_presentation_delay_max: u32,
}

impl Default for QosPreferences {
    fn default() -> Self {
        Self {
            framing: 0,
            preferred_phy: 0x02,
            preferred_retransmission_number: 2,
            max_transport_latency: 100,
            presentation_delay_min: 10_000,
            presentation_delay_max: 40_000,
            preferred_presentation_delay_min: 10_000,
            preferred_presentation_delay_max: 40_000,
        }
    }
}

/// Codec parameters held from Codec Configured onwards.
#[derive(Debug, Clone, Default)]
pub struct CodecConfig {
    pub codec_id: CodecId,
    pub config: Vec<u8, MAX_CODEC_CONFIG>,
}

/// QoS parameters held from QoS Configured onwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct QosParams {
    pub cig_id: u8,
    pub cis_id: u8,
    /// SDU interval, microseconds (24 bit on the wire).
    pub sdu_interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu: u16,
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
    /// Presentation delay, microseconds (24 bit on the wire).
    pub presentation_delay: u32,
}

/// Coupling context for the Enabling/Streaming/Disabling states.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub codec: CodecConfig,
    pub qos: QosParams,
    pub metadata: Vec<u8, MAX_METADATA>,
}

/// State of the ASE with respect to the ASE state machine.
#[derive(Debug, Clone, Default)]
pub enum AseState {
    #[default]
    Idle,
    CodecConfigured(CodecConfig),
    QosConfigured(CodecConfig, QosParams),
    Enabling(StreamContext),
    Streaming(StreamContext),
    Disabling(StreamContext),
    Releasing(CodecConfig),
}

impl AseState {
    /// Wire value of the state.
    pub fn id(&self) -> u8 {
        match self {
            AseState::Idle => 0x00,
            AseState::CodecConfigured(_) => 0x01,
            AseState::QosConfigured(..) => 0x02,
            AseState::Enabling(_) => 0x03,
            AseState::Streaming(_) => 0x04,
            AseState::Disabling(_) => 0x05,
            AseState::Releasing(_) => 0x06,
        }
    }
}

/// One Audio Stream Endpoint.
#[derive(Debug)]
pub struct Ase {
    /// Identifier of this ASE, assigned by the server.
    pub id: u8,
    pub direction: Direction,
    pub state: AseState,
}

/// Parsed per-ASE operation, borrowed out of a control-point write.
enum OpParams<'d> {
    Codec {
        latency: u8,
        phy: u8,
        codec_id: [u8; 5],
        config: &'d [u8],
    },
    Qos(QosParams),
    Metadata(&'d [u8]),
    Bare,
}

struct ParsedOp<'d> {
    id: u8,
    params: OpParams<'d>,
}

/// IDs of the ASEs whose status changed in one control-point write.
pub type AseChanges<const ASES: usize> = Vec<u8, ASES>;

/// The ASE bank of one peer session.
pub struct AseBank<const ASES: usize> {
    ases: Vec<Ase, ASES>,
    prefs: QosPreferences,
    rsp_buf: Vec<u8, RSP_BUF_SIZE>,
    ase_buf: Vec<u8, ASE_BUF_SIZE>,
}

impl<const ASES: usize> AseBank<ASES> {
    /// Creates the bank with one ASE per requested direction; IDs are
    /// assigned 1..=n in order.
    pub fn new(directions: &[Direction], prefs: QosPreferences) -> Result<Self, Error> {
        let mut ases = Vec::new();
        for (index, direction) in directions.iter().enumerate() {
            ases.push(Ase {
                id: index as u8 + 1,
                direction: *direction,
                state: AseState::Idle,
            })
            .map_err(|_| Error::NoMemory)?;
        }
        Ok(Self {
            ases,
            prefs,
            rsp_buf: Vec::new(),
            ase_buf: Vec::new(),
        })
    }

    pub fn ase(&self, id: u8) -> Option<&Ase> {
        self.ases.iter().find(|ase| ase.id == id)
    }

    fn ase_mut(&mut self, id: u8) -> Option<&mut Ase> {
        self.ases.iter_mut().find(|ase| ase.id == id)
    }

    pub fn ases(&self) -> &[Ase] {
        &self.ases
    }

    /// The response notification built by the last control-point write.
    pub fn control_point_response(&self) -> &[u8] {
        &self.rsp_buf
    }

    /// Handles an ASE Control Point write and returns the IDs whose
    /// status must be notified. The response notification is left in
    /// the bank's scratch ([`Self::control_point_response`]).
    pub fn handle_control_point(&mut self, data: &[u8]) -> AseChanges<ASES> {
        let mut changed = AseChanges::new();
        let opcode_raw = data.first().copied().unwrap_or(0);

        let Some(opcode) = AseControlOpcode::from_raw(opcode_raw) else {
            self.empty_response(opcode_raw, ResponseCode::UnsupportedOpcode);
            return changed;
        };
        if data.len() < 2 {
            self.empty_response(opcode_raw, ResponseCode::Truncated);
            return changed;
        }
        let num = data[1] as usize;
        if num == 0 || num > ASES {
            self.empty_response(opcode_raw, ResponseCode::Truncated);
            return changed;
        }

        let mut parsed: Vec<ParsedOp, ASES> = Vec::new();
        let mut cursor = &data[2..];
        for _ in 0..num {
            match Self::parse_op(opcode, cursor) {
                Some((op, rest)) => {
                    cursor = rest;
                    // num is bounded by ASES above.
                    let _ = parsed.push(op);
                }
                None => {
                    self.empty_response(opcode_raw, ResponseCode::Truncated);
                    return changed;
                }
            }
        }
        if !cursor.is_empty() {
            self.empty_response(opcode_raw, ResponseCode::Truncated);
            return changed;
        }

        self.rsp_buf.clear();
        let _ = self.rsp_buf.push(opcode_raw);
        let _ = self.rsp_buf.push(num as u8);
        for op in parsed {
            let id = op.id;
            let (code, reason) = self.apply(opcode, op);
            if code == ResponseCode::Success && !changed.contains(&id) {
                let _ = changed.push(id);
            }
            let _ = self.rsp_buf.push(id);
            let _ = self.rsp_buf.push(code as u8);
            let _ = self.rsp_buf.push(reason as u8);
        }
        changed
    }

    fn empty_response(&mut self, opcode: u8, code: ResponseCode) {
        #[cfg(feature = "defmt")]
        defmt::warn!("[ascs] control point rejected, op {}", opcode);
        self.rsp_buf.clear();
        let _ = self.rsp_buf.push(opcode);
        let _ = self.rsp_buf.push(RESPONSE_NO_ASES);
        let _ = self.rsp_buf.push(code as u8);
        let _ = self.rsp_buf.push(ResponseReason::None as u8);
    }

    fn parse_op(opcode: AseControlOpcode, data: &[u8]) -> Option<(ParsedOp<'_>, &[u8])> {
        let id = *data.first()?;
        let data = &data[1..];
        match opcode {
            AseControlOpcode::ConfigCodec => {
                if data.len() < 8 {
                    return None;
                }
                let config_len = data[7] as usize;
                let config = data.get(8..8 + config_len)?;
                Some((
                    ParsedOp {
                        id,
                        params: OpParams::Codec {
                            latency: data[0],
                            phy: data[1],
                            codec_id: [data[2], data[3], data[4], data[5], data[6]],
                            config,
                        },
                    },
                    &data[8 + config_len..],
                ))
            }
            AseControlOpcode::ConfigQos => {
                if data.len() < 15 {
                    return None;
                }
                let params = QosParams {
                    cig_id: data[0],
                    cis_id: data[1],
                    sdu_interval: u32::from_le_bytes([data[2], data[3], data[4], 0]),
                    framing: data[5],
                    phy: data[6],
                    max_sdu: u16::from_le_bytes([data[7], data[8]]),
                    retransmission_number: data[9],
                    max_transport_latency: u16::from_le_bytes([data[10], data[11]]),
                    presentation_delay: u32::from_le_bytes([data[12], data[13], data[14], 0]),
                };
                Some((
                    ParsedOp {
                        id,
                        params: OpParams::Qos(params),
                    },
                    &data[15..],
                ))
            }
            AseControlOpcode::Enable | AseControlOpcode::UpdateMetadata => {
                let metadata_len = *data.first()? as usize;
                let metadata = data.get(1..1 + metadata_len)?;
                Some((
                    ParsedOp {
                        id,
                        params: OpParams::Metadata(metadata),
                    },
                    &data[1 + metadata_len..],
                ))
            }
            _ => Some((
                ParsedOp {
                    id,
                    params: OpParams::Bare,
                },
                data,
            )),
        }
    }

    fn apply(&mut self, opcode: AseControlOpcode, op: ParsedOp<'_>) -> (ResponseCode, ResponseReason) {
        let prefs = self.prefs;
        let Some(ase) = self.ase_mut(op.id) else {
            return (ResponseCode::InvalidAseId, ResponseReason::None);
        };

        match (opcode, op.params) {
            (AseControlOpcode::ConfigCodec, OpParams::Codec { latency, phy, codec_id, config }) => {
                if !matches!(
                    ase.state,
                    AseState::Idle | AseState::CodecConfigured(_) | AseState::QosConfigured(..)
                ) {
                    return (ResponseCode::InvalidAseState, ResponseReason::None);
                }
                if !(1..=3).contains(&latency) {
                    return (ResponseCode::InvalidConfig, ResponseReason::Latency);
                }
                if !(1..=3).contains(&phy) {
                    return (ResponseCode::InvalidConfig, ResponseReason::Phy);
                }
                let Ok(config) = Vec::from_slice(config) else {
                    return (ResponseCode::UnsupportedConfig, ResponseReason::CodecData);
                };
                ase.state = AseState::CodecConfigured(CodecConfig {
                    codec_id: CodecId(codec_id),
                    config,
                });
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::ConfigQos, OpParams::Qos(params)) => {
                let codec = match &ase.state {
                    AseState::CodecConfigured(codec) => codec.clone(),
                    AseState::QosConfigured(codec, _) => codec.clone(),
                    _ => return (ResponseCode::InvalidAseState, ResponseReason::None),
                };
                if !(0x0000FF..=0xFF_FFFF).contains(&params.sdu_interval) {
                    return (ResponseCode::InvalidConfig, ResponseReason::SduInterval);
                }
                if params.framing > 1 {
                    return (ResponseCode::InvalidConfig, ResponseReason::Framing);
                }
                if !(1..=3).contains(&params.phy) {
                    return (ResponseCode::InvalidConfig, ResponseReason::Phy);
                }
                if params.max_sdu > 0x0FFF {
                    return (ResponseCode::InvalidConfig, ResponseReason::MaxSdu);
                }
                if !(0x0005..=0x0FA0).contains(&params.max_transport_latency) {
                    return (ResponseCode::InvalidConfig, ResponseReason::Latency);
                }
                if params.presentation_delay < prefs.presentation_delay_min
                    || params.presentation_delay > prefs.presentation_delay_max
                {
                    return (ResponseCode::RejectedConfig, ResponseReason::PresentationDelay);
                }
                ase.state = AseState::QosConfigured(codec, params);
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::Enable, OpParams::Metadata(metadata)) => {
                let AseState::QosConfigured(codec, qos) = &ase.state else {
                    return (ResponseCode::InvalidAseState, ResponseReason::None);
                };
                let (code, reason) = Self::check_metadata(metadata);
                if code != ResponseCode::Success {
                    return (code, reason);
                }
                let context = StreamContext {
                    codec: codec.clone(),
                    qos: *qos,
                    metadata: Vec::from_slice(metadata).unwrap_or_default(),
                };
                ase.state = AseState::Enabling(context);
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::ReceiverStartReady, OpParams::Bare) => {
                // Clients signal readiness for server-to-client streams
                // only; sink ASEs start on the server's own call.
                if ase.direction != Direction::Source {
                    return (ResponseCode::InvalidAseState, ResponseReason::None);
                }
                let AseState::Enabling(context) = &ase.state else {
                    return (ResponseCode::InvalidAseState, ResponseReason::None);
                };
                let context = context.clone();
                ase.state = AseState::Streaming(context);
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::Disable, OpParams::Bare) => {
                let context = match &ase.state {
                    AseState::Enabling(context) | AseState::Streaming(context) => context.clone(),
                    _ => return (ResponseCode::InvalidAseState, ResponseReason::None),
                };
                ase.state = match ase.direction {
                    // A sink stops immediately; a source keeps the data
                    // path up until the receiver confirms it stopped.
                    Direction::Sink => AseState::QosConfigured(context.codec, context.qos),
                    Direction::Source => AseState::Disabling(context),
                };
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::ReceiverStopReady, OpParams::Bare) => {
                if ase.direction != Direction::Source {
                    return (ResponseCode::InvalidAseState, ResponseReason::None);
                }
                let AseState::Disabling(context) = &ase.state else {
                    return (ResponseCode::InvalidAseState, ResponseReason::None);
                };
                let (codec, qos) = (context.codec.clone(), context.qos);
                ase.state = AseState::QosConfigured(codec, qos);
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::UpdateMetadata, OpParams::Metadata(metadata)) => {
                let enabling = matches!(ase.state, AseState::Enabling(_));
                let mut context = match &ase.state {
                    AseState::Enabling(context) | AseState::Streaming(context) => context.clone(),
                    _ => return (ResponseCode::InvalidAseState, ResponseReason::None),
                };
                let (code, reason) = Self::check_metadata(metadata);
                if code != ResponseCode::Success {
                    return (code, reason);
                }
                context.metadata = Vec::from_slice(metadata).unwrap_or_default();
                ase.state = if enabling {
                    AseState::Enabling(context)
                } else {
                    AseState::Streaming(context)
                };
                (ResponseCode::Success, ResponseReason::None)
            }
            (AseControlOpcode::Release, OpParams::Bare) => {
                let codec = match &ase.state {
                    AseState::CodecConfigured(codec) => codec.clone(),
                    AseState::QosConfigured(codec, _) => codec.clone(),
                    AseState::Enabling(context)
                    | AseState::Streaming(context)
                    | AseState::Disabling(context) => context.codec.clone(),
                    _ => return (ResponseCode::InvalidAseState, ResponseReason::None),
                };
                ase.state = AseState::Releasing(codec);
                (ResponseCode::Success, ResponseReason::None)
            }
            _ => (ResponseCode::Unspecified, ResponseReason::None),
        }
    }

    fn check_metadata(metadata: &[u8]) -> (ResponseCode, ResponseReason) {
        if metadata.len() > MAX_METADATA {
            return (ResponseCode::UnsupportedMetadata, ResponseReason::Metadata);
        }
        // Metadata is an LTV sequence: length, type, value bytes.
        let mut cursor = metadata;
        while let Some(&len) = cursor.first() {
            if len == 0 || cursor.len() < 1 + len as usize {
                return (ResponseCode::InvalidMetadata, ResponseReason::Metadata);
            }
            cursor = &cursor[1 + len as usize..];
        }
        (ResponseCode::Success, ResponseReason::None)
    }

    /// Server-side start of a sink stream once audio data flows.
    pub fn receiver_start_ready(&mut self, id: u8) -> Result<(), Error> {
        let ase = self.ase_mut(id).ok_or(Error::InvalidParam)?;
        if ase.direction != Direction::Sink {
            return Err(Error::NotPermitted);
        }
        let AseState::Enabling(context) = &ase.state else {
            return Err(Error::NotPermitted);
        };
        let context = context.clone();
        ase.state = AseState::Streaming(context);
        Ok(())
    }

    /// Server-side completion of a release. With `cache` the codec
    /// configuration is kept and the ASE returns to Codec Configured,
    /// otherwise it goes back to Idle.
    pub fn released(&mut self, id: u8, cache: bool) -> Result<(), Error> {
        let ase = self.ase_mut(id).ok_or(Error::InvalidParam)?;
        let AseState::Releasing(codec) = &ase.state else {
            return Err(Error::NotPermitted);
        };
        let codec = codec.clone();
        ase.state = if cache {
            AseState::CodecConfigured(codec)
        } else {
            AseState::Idle
        };
        Ok(())
    }

    /// Bonded peer went away: keep the codec configuration cached but
    /// drop every transport binding.
    pub fn detach(&mut self) {
        for ase in self.ases.iter_mut() {
            ase.state = match core::mem::take(&mut ase.state) {
                AseState::Idle => AseState::Idle,
                AseState::CodecConfigured(codec) => AseState::CodecConfigured(codec),
                AseState::QosConfigured(codec, _) => AseState::CodecConfigured(codec),
                AseState::Enabling(context)
                | AseState::Streaming(context)
                | AseState::Disabling(context) => AseState::CodecConfigured(context.codec),
                AseState::Releasing(_) => AseState::Idle,
            };
        }
    }

    /// Non-bonded peer went away: release everything.
    pub fn clear(&mut self) {
        for ase in self.ases.iter_mut() {
            ase.state = AseState::Idle;
        }
    }

    /// Serialises the status of one ASE into the bank's scratch and
    /// returns it; the payload layout depends on the state.
    pub fn status_payload(&mut self, id: u8) -> Option<&[u8]> {
        let index = self.ases.iter().position(|ase| ase.id == id)?;
        let prefs = self.prefs;
        self.ase_buf.clear();
        let buf = &mut self.ase_buf;
        let ase = &self.ases[index];
        let _ = buf.push(ase.id);
        let _ = buf.push(ase.state.id());
        match &ase.state {
            AseState::Idle | AseState::Releasing(_) => {}
            AseState::CodecConfigured(codec) => {
                let _ = buf.push(prefs.framing);
                let _ = buf.push(prefs.preferred_phy);
                let _ = buf.push(prefs.preferred_retransmission_number);
                push_u16(buf, prefs.max_transport_latency);
                push_u24(buf, prefs.presentation_delay_min);
                push_u24(buf, prefs.presentation_delay_max);
                push_u24(buf, prefs.preferred_presentation_delay_min);
                push_u24(buf, prefs.preferred_presentation_delay_max);
                let _ = buf.extend_from_slice(&codec.codec_id.0);
                let _ = buf.push(codec.config.len() as u8);
                let _ = buf.extend_from_slice(&codec.config);
            }
            AseState::QosConfigured(_, qos) => {
                let _ = buf.push(qos.cig_id);
                let _ = buf.push(qos.cis_id);
                push_u24(buf, qos.sdu_interval);
                let _ = buf.push(qos.framing);
                let _ = buf.push(qos.phy);
                push_u16(buf, qos.max_sdu);
                let _ = buf.push(qos.retransmission_number);
                push_u16(buf, qos.max_transport_latency);
                push_u24(buf, qos.presentation_delay);
            }
            AseState::Enabling(context) | AseState::Streaming(context) | AseState::Disabling(context) => {
                let _ = buf.push(context.qos.cig_id);
                let _ = buf.push(context.qos.cis_id);
                let _ = buf.push(context.metadata.len() as u8);
                let _ = buf.extend_from_slice(&context.metadata);
            }
        }
        Some(&self.ase_buf)
    }
}

fn push_u16(buf: &mut Vec<u8, ASE_BUF_SIZE>, value: u16) {
    let _ = buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u24(buf: &mut Vec<u8, ASE_BUF_SIZE>, value: u32) {
    let _ = buf.extend_from_slice(&value.to_le_bytes()[..3]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> AseBank<2> {
        AseBank::new(&[Direction::Sink, Direction::Source], QosPreferences::default()).unwrap()
    }

    fn config_codec(id: u8) -> [u8; 10] {
        // latency 2, phy 2, LC3, empty codec config.
        [0x01, 0x01, id, 0x02, 0x02, 0x06, 0x00, 0x00, 0x00, 0x00]
    }

    fn config_qos(id: u8) -> Vec<u8, 24> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x02, 0x01, id, 0x01, 0x01]).unwrap();
        data.extend_from_slice(&10_000u32.to_le_bytes()[..3]).unwrap(); // SDU interval
        data.extend_from_slice(&[0x00, 0x02]).unwrap(); // framing, phy
        data.extend_from_slice(&120u16.to_le_bytes()).unwrap(); // max SDU
        data.push(2).unwrap(); // rtn
        data.extend_from_slice(&20u16.to_le_bytes()).unwrap(); // latency
        data.extend_from_slice(&20_000u32.to_le_bytes()[..3]).unwrap(); // pd
        data
    }

    fn enable(id: u8) -> [u8; 7] {
        // metadata: one LTV {len 3, type 2, value 2 bytes}.
        [0x03, 0x01, id, 0x04, 0x03, 0x02, 0x04]
    }

    fn assert_success(bank: &AseBank<2>, opcode: u8, id: u8) {
        assert_eq!(
            bank.control_point_response(),
            &[opcode, 1, id, ResponseCode::Success as u8, 0x00]
        );
    }

    #[test]
    fn full_sink_lifecycle() {
        let mut b = bank();
        assert_eq!(b.handle_control_point(&config_codec(1)).as_slice(), &[1]);
        assert_success(&b, 0x01, 1);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x01);

        assert_eq!(b.handle_control_point(&config_qos(1)).as_slice(), &[1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x02);

        assert_eq!(b.handle_control_point(&enable(1)).as_slice(), &[1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x03);

        // Sink ASEs enter Streaming on the server's data-start call.
        b.receiver_start_ready(1).unwrap();
        assert_eq!(b.ase(1).unwrap().state.id(), 0x04);

        // Disable on a sink drops straight back to QoS Configured.
        assert_eq!(b.handle_control_point(&[0x05, 0x01, 1]).as_slice(), &[1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x02);

        assert_eq!(b.handle_control_point(&[0x08, 0x01, 1]).as_slice(), &[1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x06);
        b.released(1, false).unwrap();
        assert_eq!(b.ase(1).unwrap().state.id(), 0x00);
    }

    #[test]
    fn source_disable_goes_through_disabling() {
        let mut b = bank();
        b.handle_control_point(&config_codec(2));
        b.handle_control_point(&config_qos(2));
        b.handle_control_point(&enable(2));
        // Client confirms readiness for a source ASE.
        assert_eq!(b.handle_control_point(&[0x04, 0x01, 2]).as_slice(), &[2]);
        assert_eq!(b.ase(2).unwrap().state.id(), 0x04);

        b.handle_control_point(&[0x05, 0x01, 2]);
        assert_eq!(b.ase(2).unwrap().state.id(), 0x05);
        b.handle_control_point(&[0x06, 0x01, 2]);
        assert_eq!(b.ase(2).unwrap().state.id(), 0x02);
    }

    #[test]
    fn receiver_start_ready_is_client_side_for_sources_only() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_qos(1));
        b.handle_control_point(&enable(1));
        b.handle_control_point(&[0x04, 0x01, 1]);
        assert_eq!(
            b.control_point_response(),
            &[0x04, 1, 1, ResponseCode::InvalidAseState as u8, 0x00]
        );
        // And the server call rejects source ASEs.
        assert_eq!(b.receiver_start_ready(2).unwrap_err(), Error::NotPermitted);
    }

    #[test]
    fn unsupported_opcode_and_truncation_flag_no_ases() {
        let mut b = bank();
        assert!(b.handle_control_point(&[0x77, 0x01, 1]).is_empty());
        assert_eq!(
            b.control_point_response(),
            &[0x77, RESPONSE_NO_ASES, ResponseCode::UnsupportedOpcode as u8, 0x00]
        );

        // Declared two entries, supplied one.
        assert!(b.handle_control_point(&[0x08, 0x02, 1]).is_empty());
        assert_eq!(
            b.control_point_response(),
            &[0x08, RESPONSE_NO_ASES, ResponseCode::Truncated as u8, 0x00]
        );

        // Trailing garbage.
        assert!(b.handle_control_point(&[0x08, 0x01, 1, 9]).is_empty());
        assert_eq!(b.control_point_response()[1], RESPONSE_NO_ASES);

        // Zero entries.
        assert!(b.handle_control_point(&[0x08, 0x00]).is_empty());
        assert_eq!(b.control_point_response()[1], RESPONSE_NO_ASES);
    }

    #[test]
    fn invalid_ase_id_and_state_are_per_entry() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        // Release ASE 9 (unknown) and enable ASE 1 (wrong state, QoS not
        // configured) in separate writes.
        b.handle_control_point(&[0x08, 0x01, 9]);
        assert_eq!(
            b.control_point_response(),
            &[0x08, 1, 9, ResponseCode::InvalidAseId as u8, 0x00]
        );
        b.handle_control_point(&enable(1));
        assert_eq!(
            b.control_point_response(),
            &[0x03, 1, 1, ResponseCode::InvalidAseState as u8, 0x00]
        );
    }

    #[test]
    fn config_validation_reports_the_failing_field() {
        let mut b = bank();
        // Bad target latency.
        let mut bad = config_codec(1);
        bad[3] = 0x09;
        b.handle_control_point(&bad);
        assert_eq!(
            b.control_point_response(),
            &[0x01, 1, 1, ResponseCode::InvalidConfig as u8, ResponseReason::Latency as u8]
        );

        b.handle_control_point(&config_codec(1));
        // Presentation delay outside the server window.
        let mut qos = config_qos(1);
        let len = qos.len();
        qos[len - 3..].copy_from_slice(&100_000u32.to_le_bytes()[..3]);
        b.handle_control_point(&qos);
        assert_eq!(
            b.control_point_response(),
            &[
                0x02,
                1,
                1,
                ResponseCode::RejectedConfig as u8,
                ResponseReason::PresentationDelay as u8
            ]
        );
        // State unchanged by the rejection.
        assert_eq!(b.ase(1).unwrap().state.id(), 0x01);
    }

    #[test]
    fn metadata_is_validated_as_ltv() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_qos(1));
        // Length byte runs past the value.
        b.handle_control_point(&[0x03, 0x01, 1, 0x02, 0x05, 0x02]);
        assert_eq!(
            b.control_point_response(),
            &[0x03, 1, 1, ResponseCode::InvalidMetadata as u8, ResponseReason::Metadata as u8]
        );
        assert_eq!(b.ase(1).unwrap().state.id(), 0x02);
    }

    #[test]
    fn update_metadata_keeps_the_state() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_qos(1));
        b.handle_control_point(&enable(1));
        assert_eq!(b.handle_control_point(&[0x07, 0x01, 1, 0x02, 0x01, 0x05]).as_slice(), &[1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x03);
        let status = b.status_payload(1).unwrap();
        assert_eq!(&status[4..], &[0x01, 0x05]);
    }

    #[test]
    fn multi_ase_write_gets_one_entry_each() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_codec(2));
        let changed = b.handle_control_point(&[0x08, 0x02, 1, 2]);
        assert_eq!(changed.as_slice(), &[1, 2]);
        assert_eq!(
            b.control_point_response(),
            &[0x08, 2, 1, 0x00, 0x00, 2, 0x00, 0x00]
        );
    }

    #[test]
    fn detach_caches_codec_and_clear_does_not() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_qos(1));
        b.handle_control_point(&enable(1));
        b.detach();
        assert_eq!(b.ase(1).unwrap().state.id(), 0x01);

        b.handle_control_point(&config_qos(1));
        b.clear();
        assert_eq!(b.ase(1).unwrap().state.id(), 0x00);
    }

    #[test]
    fn release_is_legal_from_every_configured_state() {
        // Codec Configured.
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&[0x08, 0x01, 1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x06);

        // Streaming, via the full lifecycle.
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_qos(1));
        b.handle_control_point(&enable(1));
        b.receiver_start_ready(1).unwrap();
        b.handle_control_point(&[0x08, 0x01, 1]);
        assert_eq!(b.ase(1).unwrap().state.id(), 0x06);
        // Released with caching returns to Codec Configured.
        b.released(1, true).unwrap();
        assert_eq!(b.ase(1).unwrap().state.id(), 0x01);

        // Idle ASEs cannot be released.
        let mut b = bank();
        b.handle_control_point(&[0x08, 0x01, 1]);
        assert_eq!(
            b.control_point_response(),
            &[0x08, 1, 1, ResponseCode::InvalidAseState as u8, 0x00]
        );
    }

    #[test]
    fn oversized_metadata_is_unsupported() {
        let mut b = bank();
        b.handle_control_point(&config_codec(1));
        b.handle_control_point(&config_qos(1));
        let mut pdu: Vec<u8, 64> = Vec::new();
        pdu.extend_from_slice(&[0x03, 0x01, 1, 40]).unwrap();
        // One well-formed LTV spanning 40 bytes, over the bound.
        pdu.push(39).unwrap();
        pdu.push(0x02).unwrap();
        for _ in 0..38 {
            pdu.push(0).unwrap();
        }
        b.handle_control_point(&pdu);
        assert_eq!(
            b.control_point_response(),
            &[0x03, 1, 1, ResponseCode::UnsupportedMetadata as u8, ResponseReason::Metadata as u8]
        );
    }

    #[test]
    fn qos_config_is_rejected_outside_codec_configured() {
        let mut b = bank();
        b.handle_control_point(&config_qos(1));
        assert_eq!(
            b.control_point_response(),
            &[0x02, 1, 1, ResponseCode::InvalidAseState as u8, 0x00]
        );
    }

    #[test]
    fn status_payload_layouts() {
        let mut b = bank();
        assert_eq!(b.status_payload(1).unwrap(), &[1, 0x00]);
        assert!(b.status_payload(9).is_none());

        b.handle_control_point(&config_codec(1));
        let status = b.status_payload(1).unwrap().to_vec();
        assert_eq!(&status[..2], &[1, 0x01]);
        // framing, phy, rtn, latency(2), pd windows (4 × 3), codec id (5), len.
        assert_eq!(status.len(), 2 + 3 + 2 + 12 + 5 + 1);
        assert_eq!(status[status.len() - 1], 0);

        b.handle_control_point(&config_qos(1));
        let status = b.status_payload(1).unwrap().to_vec();
        assert_eq!(&status[..2], &[1, 0x02]);
        assert_eq!(status.len(), 2 + 15);
        assert_eq!(&status[2..4], &[1, 1]); // cig, cis

        b.handle_control_point(&enable(1));
        let status = b.status_payload(1).unwrap().to_vec();
        assert_eq!(&status[..2], &[1, 0x03]);
        assert_eq!(&status[2..], &[1, 1, 2, 0x02, 0x04]);
    }
}
