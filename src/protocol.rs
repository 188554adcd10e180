//! Wire protocol for the session layer (spec.md 6)
//!
//! Each frame is a two-byte big-endian length prefix (excluding the prefix itself) followed by
//! three length-prefixed UTF-16BE strings (`flag`, `target`, `command`) and a length-prefixed
//! list of heterogeneous typed values. String and list lengths are counts of bytes / elements,
//! not UTF-16 code units. This mirrors the framing the original C++/Qt session layer built on
//! `QDataStream` (see `original_source/dummy_server_socket.py`), adapted to a fixed,
//! self-describing tag per value instead of `QVariant`'s runtime type info.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stable per-connection identifier assigned by the session layer at accept time.
///
/// Distinct from the client's user-visible `name`: a connection keeps the same `ClientId` for
/// its whole lifetime even though `CON` may rename it ("alice" -> "alice(1)") for uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

/// `target` this server answers to; other targets are ignored by the session layer (spec.md 6)
pub const TARGET: &str = "WVM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Control,
    Data,
}

impl Flag {
    fn as_str(self) -> &'static str {
        match self {
            Flag::Control => "C",
            Flag::Data => "D",
        }
    }

    fn parse(s: &str) -> Result<Self, ProtocolError> {
        match s {
            "C" => Ok(Flag::Control),
            "D" => Ok(Flag::Data),
            other => Err(ProtocolError::UnknownFlag(other.to_string())),
        }
    }
}

/// A single heterogeneous value in a frame's data list
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<Vec<String>> {
        match self {
            Value::List(items) => items.iter().map(|v| v.as_str().map(String::from)).collect(),
            _ => None,
        }
    }
}

/// A fully decoded frame: `flag`, `target`, 3-letter `command`, and its typed data list
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flag: Flag,
    pub target: String,
    pub command: String,
    pub data: Vec<Value>,
}

impl Frame {
    pub fn control(command: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            flag: Flag::Control,
            target: TARGET.to_string(),
            command: command.into(),
            data,
        }
    }

    pub fn data_update(command: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            flag: Flag::Data,
            target: TARGET.to_string(),
            command: command.into(),
            data,
        }
    }

    pub fn nak(reason: impl Into<String>) -> Self {
        Frame::control("NAK", vec![Value::Str(reason.into())])
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame exceeds the maximum encodable length")]
    FrameTooLarge,
    #[error("unknown flag {0:?}, expected \"C\" or \"D\"")]
    UnknownFlag(String),
    #[error("frame was addressed to target {0:?}, not \"WVM\"")]
    WrongTarget(String),
    #[error("truncated frame")]
    Truncated,
    #[error("string was not valid UTF-16")]
    InvalidUtf16,
    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),
    #[error("unknown command {flag:?} {command}")]
    UnknownCommand { flag: Flag, command: String },
    #[error("malformed data for command {command}: {reason}")]
    MalformedData { command: String, reason: String },
}

fn read_u16(buf: &mut impl Buf) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u16())
}

fn read_utf16be_string(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    let byte_len = read_u16(buf)? as usize;
    if buf.remaining() < byte_len || byte_len % 2 != 0 {
        return Err(ProtocolError::Truncated);
    }
    let units: Vec<u16> = (0..byte_len / 2).map(|_| buf.get_u16()).collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16)
}

fn write_utf16be_string(buf: &mut impl BufMut, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    buf.put_u16((units.len() * 2) as u16);
    for unit in units {
        buf.put_u16(unit);
    }
}

fn read_value(buf: &mut impl Buf) -> Result<Value, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated);
    }
    let tag = buf.get_u8();
    match tag {
        0 => Ok(Value::Str(read_utf16be_string(buf)?)),
        1 => {
            if buf.remaining() < 8 {
                return Err(ProtocolError::Truncated);
            }
            Ok(Value::Int(buf.get_i64()))
        }
        2 => {
            if buf.remaining() < 8 {
                return Err(ProtocolError::Truncated);
            }
            Ok(Value::Float(buf.get_f64()))
        }
        3 => {
            let count = read_u16(buf)? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(buf)?);
            }
            Ok(Value::List(items))
        }
        other => Err(ProtocolError::UnknownValueTag(other)),
    }
}

fn write_value(buf: &mut impl BufMut, value: &Value) {
    match value {
        Value::Str(s) => {
            buf.put_u8(0);
            write_utf16be_string(buf, s);
        }
        Value::Int(i) => {
            buf.put_u8(1);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(2);
            buf.put_f64(*f);
        }
        Value::List(items) => {
            buf.put_u8(3);
            buf.put_u16(items.len() as u16);
            for item in items {
                write_value(buf, item);
            }
        }
    }
}

/// tokio-util [`Decoder`]/[`Encoder`] pair implementing the length-prefixed frame protocol
#[derive(Debug, Default)]
pub struct WavemeterCodec;

impl Decoder for WavemeterCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        let mut frame_bytes = src.split_to(2 + len);
        frame_bytes.advance(2);

        let flag = Flag::parse(&read_utf16be_string(&mut frame_bytes)?)?;
        let target = read_utf16be_string(&mut frame_bytes)?;
        let command = read_utf16be_string(&mut frame_bytes)?;
        let count = read_u16(&mut frame_bytes)? as usize;
        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            data.push(read_value(&mut frame_bytes)?);
        }
        Ok(Some(Frame {
            flag,
            target,
            command,
            data,
        }))
    }
}

impl Encoder<Frame> for WavemeterCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        write_utf16be_string(&mut body, frame.flag.as_str());
        write_utf16be_string(&mut body, &frame.target);
        write_utf16be_string(&mut body, &frame.command);
        body.put_u16(frame.data.len() as u16);
        for value in &frame.data {
            write_value(&mut body, value);
        }
        if body.len() > u16::MAX as usize {
            return Err(ProtocolError::FrameTooLarge);
        }
        dst.put_u16(body.len() as u16);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
