use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Width of the request id field on the wire.
pub const REQ_ID_LEN: usize = 10;
/// Width of a MAC address field on the wire.
pub const MAC_LEN: usize = 17;
/// Width of an IPv4 address field on the wire.
pub const IP_LEN: usize = 15;

/// Protocol state carried in the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Consumer asks the orchestrator for a host.
    HostRequest,
    /// Orchestrator names a host.
    HostResponse,
    /// Orchestrator asks a potential host to reserve resources.
    ReserveRequest,
    /// Host confirms the reservation.
    ReserveResponse,
    /// Orchestrator acknowledges the reservation.
    ReserveAck,
    /// Either side cancels the reservation.
    ReserveCancel,
    /// Consumer ships the payload to the host.
    DataRequest,
    /// Host ships the result back.
    DataResponse,
    /// Consumer acknowledges the result toward the orchestrator.
    DataAck,
    /// Either side cancels the data exchange.
    DataCancel,
    /// Host signals that execution is still in progress.
    DataWait,
}

impl State {
    pub fn wire(self) -> u8 {
        match self {
            State::HostRequest => 1,
            State::HostResponse => 2,
            State::ReserveRequest => 3,
            State::ReserveResponse => 4,
            State::ReserveAck => 5,
            State::ReserveCancel => 6,
            State::DataRequest => 7,
            State::DataResponse => 8,
            State::DataAck => 9,
            State::DataCancel => 10,
            State::DataWait => 11,
        }
    }

    pub fn from_wire(value: u8) -> Option<State> {
        Some(match value {
            1 => State::HostRequest,
            2 => State::HostResponse,
            3 => State::ReserveRequest,
            4 => State::ReserveResponse,
            5 => State::ReserveAck,
            6 => State::ReserveCancel,
            7 => State::DataRequest,
            8 => State::DataResponse,
            9 => State::DataAck,
            10 => State::DataCancel,
            11 => State::DataWait,
            _ => return None,
        })
    }

    /// Whether a frame in state `self` answers a query in state `query`.
    pub fn answers(self, query: State) -> bool {
        use State::*;
        matches!(
            (query, self),
            (HostRequest, HostResponse)
                | (ReserveRequest, ReserveResponse)
                | (ReserveRequest, ReserveCancel)
                | (ReserveResponse, ReserveAck)
                | (ReserveResponse, ReserveCancel)
                | (DataRequest, DataResponse)
                | (DataRequest, DataWait)
                | (DataRequest, DataCancel)
                | (DataResponse, DataAck)
                | (DataResponse, DataCancel)
        )
    }

    /// The class of service id travels only on the two request states.
    fn has_cos(self) -> bool {
        matches!(self, State::HostRequest | State::ReserveRequest)
    }

    /// Payload and result travel on the data exchange states.
    fn has_data(self) -> bool {
        matches!(self, State::DataRequest | State::DataResponse)
    }

    /// Consumer addressing fields, kept by the orchestrator when it relays.
    fn has_src(self) -> bool {
        matches!(
            self,
            State::ReserveRequest
                | State::ReserveResponse
                | State::ReserveAck
                | State::ReserveCancel
                | State::DataAck
                | State::DataCancel
        )
    }

    /// Selected-host addressing fields.
    fn has_host(self) -> bool {
        matches!(self, State::HostResponse | State::DataAck | State::DataCancel)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::HostRequest => "HREQ",
            State::HostResponse => "HRES",
            State::ReserveRequest => "RREQ",
            State::ReserveResponse => "RRES",
            State::ReserveAck => "RACK",
            State::ReserveCancel => "RCAN",
            State::DataRequest => "DREQ",
            State::DataResponse => "DRES",
            State::DataAck => "DACK",
            State::DataCancel => "DCAN",
            State::DataWait => "DWAIT",
        };
        write!(f, "{}", name)
    }
}

/// One protocol frame.
///
/// The fixed leading fields are always present; the remaining fields travel
/// on the wire only for the states that carry them (see the `has_*`
/// predicates) and are left empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub state: State,
    pub req_id: String,
    pub attempt_no: u32,
    pub cos_id: u32,
    pub data: Bytes,
    pub src_mac: String,
    pub src_ip: String,
    pub host_mac: String,
    pub host_ip: String,
}

impl Frame {
    fn new(state: State, req_id: &str, attempt_no: u32) -> Frame {
        Frame {
            state,
            req_id: req_id.to_string(),
            attempt_no,
            cos_id: 1,
            data: Bytes::new(),
            src_mac: String::new(),
            src_ip: String::new(),
            host_mac: String::new(),
            host_ip: String::new(),
        }
    }

    pub fn host_request(req_id: &str, attempt_no: u32, cos_id: u32) -> Frame {
        let mut frame = Frame::new(State::HostRequest, req_id, attempt_no);
        frame.cos_id = cos_id;
        frame
    }

    pub fn host_response(req_id: &str, attempt_no: u32, host_mac: &str, host_ip: &str) -> Frame {
        let mut frame = Frame::new(State::HostResponse, req_id, attempt_no);
        frame.host_mac = host_mac.to_string();
        frame.host_ip = host_ip.to_string();
        frame
    }

    pub fn reserve_request(req_id: &str, attempt_no: u32, cos_id: u32, src_mac: &str, src_ip: &str) -> Frame {
        let mut frame = Frame::new(State::ReserveRequest, req_id, attempt_no);
        frame.cos_id = cos_id;
        frame.src_mac = src_mac.to_string();
        frame.src_ip = src_ip.to_string();
        frame
    }

    pub fn reserve_response(req_id: &str, attempt_no: u32, src_mac: &str, src_ip: &str) -> Frame {
        let mut frame = Frame::new(State::ReserveResponse, req_id, attempt_no);
        frame.src_mac = src_mac.to_string();
        frame.src_ip = src_ip.to_string();
        frame
    }

    pub fn reserve_ack(req_id: &str, attempt_no: u32, src_mac: &str, src_ip: &str) -> Frame {
        let mut frame = Frame::new(State::ReserveAck, req_id, attempt_no);
        frame.src_mac = src_mac.to_string();
        frame.src_ip = src_ip.to_string();
        frame
    }

    pub fn reserve_cancel(req_id: &str, attempt_no: u32, src_mac: &str, src_ip: &str) -> Frame {
        let mut frame = Frame::new(State::ReserveCancel, req_id, attempt_no);
        frame.src_mac = src_mac.to_string();
        frame.src_ip = src_ip.to_string();
        frame
    }

    pub fn data_request(req_id: &str, attempt_no: u32, data: Bytes) -> Frame {
        let mut frame = Frame::new(State::DataRequest, req_id, attempt_no);
        frame.data = data;
        frame
    }

    pub fn data_response(req_id: &str, attempt_no: u32, data: Bytes) -> Frame {
        let mut frame = Frame::new(State::DataResponse, req_id, attempt_no);
        frame.data = data;
        frame
    }

    pub fn data_wait(req_id: &str, attempt_no: u32) -> Frame {
        Frame::new(State::DataWait, req_id, attempt_no)
    }

    pub fn data_ack(req_id: &str, attempt_no: u32, host_mac: &str, host_ip: &str) -> Frame {
        let mut frame = Frame::new(State::DataAck, req_id, attempt_no);
        frame.host_mac = host_mac.to_string();
        frame.host_ip = host_ip.to_string();
        frame
    }

    pub fn data_cancel(req_id: &str, attempt_no: u32, host_mac: &str, host_ip: &str) -> Frame {
        let mut frame = Frame::new(State::DataCancel, req_id, attempt_no);
        frame.host_mac = host_mac.to_string();
        frame.host_ip = host_ip.to_string();
        frame
    }

    pub fn with_src(mut self, src_mac: &str, src_ip: &str) -> Frame {
        self.src_mac = src_mac.to_string();
        self.src_ip = src_ip.to_string();
        self
    }

    /// Whether this frame answers `query`: same request id, and the state
    /// pair is one of the request/reply pairings of the protocol.
    pub fn answers(&self, query: &Frame) -> bool {
        self.req_id == query.req_id && self.state.answers(query.state)
    }

    /// Writes the frame into `dst` using the fixed on-wire layout.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.state.wire());
        put_padded_left(dst, &self.req_id, REQ_ID_LEN);
        dst.put_u32(self.attempt_no);
        if self.state.has_cos() {
            dst.put_u32(self.cos_id);
        }
        if self.state.has_data() {
            dst.put_slice(&self.data);
        }
        if self.state.has_src() {
            put_padded_right(dst, &self.src_mac, MAC_LEN);
            put_padded_right(dst, &self.src_ip, IP_LEN);
        }
        if self.state.has_host() {
            put_padded_right(dst, &self.host_mac, MAC_LEN);
            put_padded_right(dst, &self.host_ip, IP_LEN);
        }
    }

    /// Parses one frame out of `src`, consuming it entirely.
    pub fn decode(src: &mut BytesMut) -> Result<Frame> {
        if src.len() < 1 + REQ_ID_LEN + 4 {
            return Err(Error::ProtocolViolation(format!("frame too short: {} bytes", src.len())));
        }
        let state_byte = src.get_u8();
        let state = State::from_wire(state_byte)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown state {}", state_byte)))?;
        let req_id = take_string(src, REQ_ID_LEN)?;
        let attempt_no = src.get_u32();

        let mut frame = Frame::new(state, &req_id, attempt_no);
        if state.has_cos() {
            if src.len() < 4 {
                return Err(Error::ProtocolViolation("truncated cos id".into()));
            }
            frame.cos_id = src.get_u32();
        }
        if state.has_data() {
            frame.data = src.split_to(src.len()).freeze();
        }
        if state.has_src() {
            frame.src_mac = take_string(src, MAC_LEN)?;
            frame.src_ip = take_string(src, IP_LEN)?;
        }
        if state.has_host() {
            frame.host_mac = take_string(src, MAC_LEN)?;
            frame.host_ip = take_string(src, IP_LEN)?;
        }
        Ok(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(req_id={}, attempt_no={}", self.state, self.req_id, self.attempt_no)?;
        if self.state.has_cos() {
            write!(f, ", cos_id={}", self.cos_id)?;
        }
        if self.state.has_data() {
            write!(f, ", data={}B", self.data.len())?;
        }
        if self.state.has_src() {
            write!(f, ", src={}/{}", self.src_ip, self.src_mac)?;
        }
        if self.state.has_host() {
            write!(f, ", host={}/{}", self.host_ip, self.host_mac)?;
        }
        write!(f, ")")
    }
}

fn put_padded_left(dst: &mut BytesMut, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let bytes = &bytes[..bytes.len().min(width)];
    for _ in bytes.len()..width {
        dst.put_u8(b' ');
    }
    dst.put_slice(bytes);
}

fn put_padded_right(dst: &mut BytesMut, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let bytes = &bytes[..bytes.len().min(width)];
    dst.put_slice(bytes);
    for _ in bytes.len()..width {
        dst.put_u8(b' ');
    }
}

fn take_string(src: &mut BytesMut, width: usize) -> Result<String> {
    if src.len() < width {
        return Err(Error::ProtocolViolation(format!(
            "truncated field: need {} bytes, have {}",
            width,
            src.len()
        )));
    }
    let raw = src.split_to(width);
    Ok(String::from_utf8_lossy(&raw).trim().to_string())
}
