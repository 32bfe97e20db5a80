//! Resumable RESP2/RESP3 decoder.
//!
//! Bytes are appended with [`Decoder::extend`] in chunks of any size. The
//! decoder keeps an explicit state (the current [`Step`] plus a stack of open
//! containers), so every byte is examined exactly once and a value may be
//! split across any number of chunks.

use crate::config::{
    BigNumberMode, BlobMode, DecodeConfig, DoubleMode, MapMode, ReplyShape, SetMode,
};
use crate::error::ProtocolError;
use crate::value::{
    lossy_text, BigNumber, Blob, Double, ErrorKind, ErrorReply, MapReply, ReplyValue, SetReply,
};
use bytes::{Buf, Bytes, BytesMut};
use indexmap::{IndexMap, IndexSet};
use num_bigint::BigInt;

/// Initial buffer capacity.
const INITIAL_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on capacity preallocated for a container from its declared length.
const MAX_PREALLOCATED_ITEMS: usize = 1024;

/// Weights of the first 17 fractional digits of a double.
const FRACTION_MULTIPLIERS: [f64; 17] = [
    1e-1, 1e-2, 1e-3, 1e-4, 1e-5, 1e-6, 1e-7, 1e-8, 1e-9, 1e-10, 1e-11, 1e-12, 1e-13, 1e-14,
    1e-15, 1e-16, 1e-17,
];

/// A complete top-level value, classified for routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A regular reply.
    Value(ReplyValue),
    /// A top-level simple or blob error.
    Error(ErrorReply),
    /// A top-level RESP3 push (`>`).
    Push(Vec<ReplyValue>),
}

impl Reply {
    fn classify(value: ReplyValue) -> Self {
        match value {
            ReplyValue::Error(err) => Reply::Error(err),
            ReplyValue::Push(items) => Reply::Push(items),
            other => Reply::Value(other),
        }
    }

    /// Converts back into a plain value (errors and pushes keep their variants).
    pub fn into_value(self) -> ReplyValue {
        match self {
            Reply::Value(value) => value,
            Reply::Error(err) => ReplyValue::Error(err),
            Reply::Push(items) => ReplyValue::Push(items),
        }
    }
}

/// Length-prefixed types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prefixed {
    BlobString,
    BlobError,
    Verbatim,
    Array,
    Set,
    Map,
    Push,
}

/// Line-terminated types collected as raw text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Simple,
    Error,
    BigNumber,
    Double,
}

#[derive(Debug, Clone, Copy)]
enum NumberTarget {
    Integer,
    Length(Prefixed),
}

/// Signed decimal accumulator terminated by CRLF.
#[derive(Debug, Default)]
struct Digits {
    negative: bool,
    value: i64,
    count: usize,
    cr: bool,
}

impl Digits {
    /// Consumes bytes up to and including the CRLF terminator.
    fn consume(&mut self, buf: &mut BytesMut) -> Result<Option<i64>, ProtocolError> {
        let mut used = 0;
        let mut result = None;
        for &byte in buf.iter() {
            used += 1;
            if self.cr {
                if byte != b'\n' {
                    return Err(ProtocolError::ExpectedCrlf { found: byte });
                }
                if self.count == 0 {
                    return Err(ProtocolError::InvalidDigit { byte: b'\r' });
                }
                result = Some(self.value);
                break;
            }
            match byte {
                b'\r' => self.cr = true,
                b'-' if self.count == 0 && !self.negative => self.negative = true,
                b'0'..=b'9' => {
                    // Negative values accumulate downward so i64::MIN fits.
                    let digit = i64::from(byte - b'0');
                    self.value = self
                        .value
                        .checked_mul(10)
                        .and_then(|v| {
                            if self.negative {
                                v.checked_sub(digit)
                            } else {
                                v.checked_add(digit)
                            }
                        })
                        .ok_or(ProtocolError::Overflow)?;
                    self.count += 1;
                }
                other => return Err(ProtocolError::InvalidDigit { byte: other }),
            }
        }
        buf.advance(used);
        Ok(result)
    }
}

/// Arbitrary precision accumulator for big numbers.
#[derive(Debug, Default)]
struct BigDigits {
    negative: bool,
    value: BigInt,
    count: usize,
    cr: bool,
}

impl BigDigits {
    fn consume(&mut self, buf: &mut BytesMut) -> Result<Option<BigInt>, ProtocolError> {
        let mut used = 0;
        let mut done = false;
        for &byte in buf.iter() {
            used += 1;
            if self.cr {
                if byte != b'\n' {
                    return Err(ProtocolError::ExpectedCrlf { found: byte });
                }
                if self.count == 0 {
                    return Err(ProtocolError::InvalidDigit { byte: b'\r' });
                }
                done = true;
                break;
            }
            match byte {
                b'\r' => self.cr = true,
                b'-' if self.count == 0 && !self.negative => self.negative = true,
                b'+' if self.count == 0 && !self.negative => {}
                b'0'..=b'9' => {
                    self.value *= 10u32;
                    self.value += u32::from(byte - b'0');
                    self.count += 1;
                }
                other => return Err(ProtocolError::InvalidDigit { byte: other }),
            }
        }
        buf.advance(used);
        if !done {
            return Ok(None);
        }
        let value = std::mem::take(&mut self.value);
        Ok(Some(if self.negative { -value } else { value }))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DoublePhase {
    #[default]
    Start,
    Integer,
    Fraction,
    ExponentStart,
    Exponent,
}

enum DoubleOutcome {
    Value(f64),
    Literal(&'static [u8], f64),
}

/// Incremental double parser: sign, integer digits, fraction, exponent.
#[derive(Debug, Default)]
struct DoubleDigits {
    phase: DoublePhase,
    negative: bool,
    integer: f64,
    fraction: f64,
    fraction_digits: usize,
    exponent_negative: bool,
    exponent: i32,
    cr: bool,
}

impl DoubleDigits {
    fn consume(&mut self, buf: &mut BytesMut) -> Result<Option<DoubleOutcome>, ProtocolError> {
        let mut used = 0;
        let mut outcome = None;
        for &byte in buf.iter() {
            used += 1;
            if self.cr {
                if byte != b'\n' {
                    return Err(ProtocolError::ExpectedCrlf { found: byte });
                }
                outcome = Some(DoubleOutcome::Value(self.value()));
                break;
            }
            match (self.phase, byte) {
                (DoublePhase::Start, b'-') if !self.negative => self.negative = true,
                (DoublePhase::Start, b'i') => {
                    let inf = if self.negative {
                        f64::NEG_INFINITY
                    } else {
                        f64::INFINITY
                    };
                    outcome = Some(DoubleOutcome::Literal(b"nf", inf));
                    break;
                }
                (DoublePhase::Start, b'n') if !self.negative => {
                    outcome = Some(DoubleOutcome::Literal(b"an", f64::NAN));
                    break;
                }
                (DoublePhase::Start | DoublePhase::Integer, b'0'..=b'9') => {
                    self.integer = self.integer * 10.0 + f64::from(byte - b'0');
                    self.phase = DoublePhase::Integer;
                }
                (DoublePhase::Start | DoublePhase::Integer, b'.') => {
                    self.phase = DoublePhase::Fraction;
                }
                (DoublePhase::Fraction, b'0'..=b'9') => {
                    if let Some(weight) = FRACTION_MULTIPLIERS.get(self.fraction_digits) {
                        self.fraction += f64::from(byte - b'0') * weight;
                    }
                    self.fraction_digits += 1;
                }
                (DoublePhase::Integer | DoublePhase::Fraction, b'e' | b'E') => {
                    self.phase = DoublePhase::ExponentStart;
                }
                (DoublePhase::ExponentStart, b'-') if !self.exponent_negative => {
                    self.exponent_negative = true;
                }
                (DoublePhase::ExponentStart, b'+') => {}
                (DoublePhase::ExponentStart | DoublePhase::Exponent, b'0'..=b'9') => {
                    // Anything past 400 is already 0 or infinity.
                    self.exponent = (self.exponent * 10 + i32::from(byte - b'0')).min(400);
                    self.phase = DoublePhase::Exponent;
                }
                (DoublePhase::Integer | DoublePhase::Fraction | DoublePhase::Exponent, b'\r') => {
                    self.cr = true;
                }
                _ => return Err(ProtocolError::InvalidDouble),
            }
        }
        buf.advance(used);
        Ok(outcome)
    }

    fn value(&self) -> f64 {
        let mut value = self.integer + self.fraction;
        if self.exponent != 0 {
            let exponent = if self.exponent_negative {
                -self.exponent
            } else {
                self.exponent
            };
            value *= 10f64.powi(exponent);
        }
        if self.negative {
            -value
        } else {
            value
        }
    }
}

/// Where the decoder is inside the value currently being read.
#[derive(Debug, Default)]
enum Step {
    /// Waiting for a type tag.
    #[default]
    Tag,
    Boolean,
    Number {
        digits: Digits,
        target: NumberTarget,
    },
    BigNumber(BigDigits),
    Double(DoubleDigits),
    /// Matching the rest of `inf` or `nan`.
    Literal {
        rest: &'static [u8],
        value: f64,
    },
    Line {
        kind: LineKind,
        buf: BytesMut,
    },
    Blob {
        kind: Prefixed,
        remaining: usize,
        buf: BytesMut,
    },
    /// Matching CRLF after a value whose content is already known.
    Terminator {
        seen: usize,
        value: ReplyValue,
    },
}

enum Progress {
    Step(Step),
    Done(ReplyValue),
}

#[derive(Debug)]
enum FrameBody {
    Array(Vec<ReplyValue>),
    Push(Vec<ReplyValue>),
    UniqueSet(IndexSet<ReplyValue>),
    SequenceSet(Vec<ReplyValue>),
    Associative(IndexMap<ReplyValue, ReplyValue>, Option<ReplyValue>),
    Keyed(IndexMap<String, ReplyValue>, Option<String>),
    Flat(Vec<ReplyValue>),
}

/// An open container.
#[derive(Debug)]
struct Frame {
    /// Configuration the container was opened with; inherited by its children.
    config: DecodeConfig,
    /// Elements (or pairs, for keyed and associative maps) still expected.
    remaining: usize,
    /// Children received so far.
    filled: usize,
    body: FrameBody,
}

impl Frame {
    fn open(kind: Prefixed, len: usize, config: DecodeConfig) -> Self {
        let capacity = len.min(MAX_PREALLOCATED_ITEMS);
        let (remaining, body) = match kind {
            Prefixed::Push => (len, FrameBody::Push(Vec::with_capacity(capacity))),
            Prefixed::Set => match config.set {
                SetMode::Unique => (len, FrameBody::UniqueSet(IndexSet::with_capacity(capacity))),
                SetMode::Sequence => (len, FrameBody::SequenceSet(Vec::with_capacity(capacity))),
            },
            Prefixed::Map => match config.map {
                MapMode::Associative => (
                    len,
                    FrameBody::Associative(IndexMap::with_capacity(capacity), None),
                ),
                MapMode::Keyed => (len, FrameBody::Keyed(IndexMap::with_capacity(capacity), None)),
                MapMode::Flat => (
                    len.saturating_mul(2),
                    FrameBody::Flat(Vec::with_capacity(capacity.saturating_mul(2))),
                ),
            },
            _ => (len, FrameBody::Array(Vec::with_capacity(capacity))),
        };
        Self {
            config,
            remaining,
            filled: 0,
            body,
        }
    }

    /// Whether the next child sits in a map key position.
    fn expects_key(&self) -> bool {
        match &self.body {
            FrameBody::Associative(_, pending) => pending.is_none(),
            FrameBody::Keyed(_, pending) => pending.is_none(),
            FrameBody::Flat(_) => self.filled % 2 == 0,
            _ => false,
        }
    }

    fn push(&mut self, value: ReplyValue) {
        self.filled += 1;
        match &mut self.body {
            FrameBody::Array(items)
            | FrameBody::Push(items)
            | FrameBody::SequenceSet(items)
            | FrameBody::Flat(items) => {
                items.push(value);
                self.remaining -= 1;
            }
            // Wire duplicates are absorbed; the count bounds the loop.
            FrameBody::UniqueSet(set) => {
                set.insert(value);
                self.remaining -= 1;
            }
            FrameBody::Associative(map, pending) => match pending.take() {
                None => *pending = Some(value),
                Some(key) => {
                    map.insert(key, value);
                    self.remaining -= 1;
                }
            },
            FrameBody::Keyed(map, pending) => match pending.take() {
                None => *pending = Some(value.key_text()),
                Some(key) => {
                    map.insert(key, value);
                    self.remaining -= 1;
                }
            },
        }
    }

    fn finish(self) -> ReplyValue {
        match self.body {
            FrameBody::Array(items) => ReplyValue::Array(items),
            FrameBody::Push(items) => ReplyValue::Push(items),
            FrameBody::UniqueSet(set) => ReplyValue::Set(SetReply::Unique(set)),
            FrameBody::SequenceSet(items) => ReplyValue::Set(SetReply::Sequence(items)),
            FrameBody::Associative(map, _) => ReplyValue::Map(MapReply::Associative(map)),
            FrameBody::Keyed(map, _) => ReplyValue::Map(MapReply::Keyed(map)),
            FrameBody::Flat(items) => ReplyValue::Map(MapReply::Flat(items)),
        }
    }
}

/// Streaming RESP decoder.
///
/// A protocol error poisons the decoder: every later call fails with
/// [`ProtocolError::Poisoned`] until [`Decoder::reset`] is called.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    step: Step,
    stack: Vec<Frame>,
    /// Shape captured when the current top-level tag was read.
    shape: ReplyShape,
    /// Configuration of the leaf value currently being read.
    config: DecodeConfig,
    /// Configuration for top-level pushes, which belong to no request.
    push_config: DecodeConfig,
    poisoned: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            step: Step::Tag,
            stack: Vec::new(),
            shape: ReplyShape::default(),
            config: DecodeConfig::default(),
            push_config: DecodeConfig::default(),
            poisoned: false,
        }
    }

    /// Sets the configuration used for top-level push values.
    pub fn set_push_config(&mut self, config: DecodeConfig) {
        self.push_config = config;
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends a chunk and decodes every top-level value it completes.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        config: &DecodeConfig,
    ) -> Result<Vec<Reply>, ProtocolError> {
        self.extend(chunk);
        let shape = ReplyShape::Uniform(*config);
        let mut replies = Vec::new();
        while let Some(reply) = self.decode_next(&shape)? {
            replies.push(reply);
        }
        Ok(replies)
    }

    /// Decodes the next complete top-level value, if the buffer holds one.
    ///
    /// `shape` only applies when this call reads the value's type tag; a
    /// value already in progress keeps the shape it started with.
    pub fn decode_next(&mut self, shape: &ReplyShape) -> Result<Option<Reply>, ProtocolError> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }
        match self.run(shape) {
            Ok(value) => Ok(value.map(Reply::classify)),
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Drops all buffered bytes and partial state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.step = Step::Tag;
        self.stack.clear();
        self.shape = ReplyShape::default();
        self.config = DecodeConfig::default();
        self.poisoned = false;
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True between top-level values with nothing buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.step, Step::Tag) && self.stack.is_empty() && self.buffer.is_empty()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn run(&mut self, shape: &ReplyShape) -> Result<Option<ReplyValue>, ProtocolError> {
        loop {
            if self.buffer.is_empty() {
                return Ok(None);
            }
            let step = std::mem::take(&mut self.step);
            match self.advance(step, shape)? {
                Progress::Step(next) => self.step = next,
                Progress::Done(value) => {
                    if let Some(top) = self.complete(value) {
                        return Ok(Some(top));
                    }
                }
            }
        }
    }

    fn advance(&mut self, step: Step, shape: &ReplyShape) -> Result<Progress, ProtocolError> {
        match step {
            Step::Tag => {
                let tag = self.buffer[0];
                self.buffer.advance(1);
                self.begin(tag, shape)
            }
            Step::Boolean => {
                let byte = self.buffer[0];
                self.buffer.advance(1);
                let value = match byte {
                    b't' => true,
                    b'f' => false,
                    other => return Err(ProtocolError::InvalidBoolean(other)),
                };
                Ok(Progress::Step(Step::Terminator {
                    seen: 0,
                    value: ReplyValue::Boolean(value),
                }))
            }
            Step::Number { mut digits, target } => match digits.consume(&mut self.buffer)? {
                Some(n) => self.finish_number(target, n),
                None => Ok(Progress::Step(Step::Number { digits, target })),
            },
            Step::BigNumber(mut digits) => match digits.consume(&mut self.buffer)? {
                Some(n) => Ok(Progress::Done(ReplyValue::BigNumber(BigNumber::Native(n)))),
                None => Ok(Progress::Step(Step::BigNumber(digits))),
            },
            Step::Double(mut digits) => match digits.consume(&mut self.buffer)? {
                Some(DoubleOutcome::Value(v)) => {
                    Ok(Progress::Done(ReplyValue::Double(Double::Native(v))))
                }
                Some(DoubleOutcome::Literal(rest, value)) => {
                    Ok(Progress::Step(Step::Literal { rest, value }))
                }
                None => Ok(Progress::Step(Step::Double(digits))),
            },
            Step::Literal { mut rest, value } => {
                while let (Some(&expected), Some(&byte)) = (rest.first(), self.buffer.first()) {
                    if byte != expected {
                        return Err(ProtocolError::InvalidDouble);
                    }
                    self.buffer.advance(1);
                    rest = &rest[1..];
                }
                if rest.is_empty() {
                    Ok(Progress::Step(Step::Terminator {
                        seen: 0,
                        value: ReplyValue::Double(Double::Native(value)),
                    }))
                } else {
                    Ok(Progress::Step(Step::Literal { rest, value }))
                }
            }
            Step::Line { kind, mut buf } => {
                match self.buffer.iter().position(|&b| b == b'\r') {
                    Some(pos) => {
                        buf.extend_from_slice(&self.buffer[..pos]);
                        self.buffer.advance(pos + 1);
                        Ok(Progress::Step(Step::Terminator {
                            seen: 1,
                            value: self.finish_line(kind, buf.freeze()),
                        }))
                    }
                    None => {
                        buf.extend_from_slice(&self.buffer);
                        self.buffer.clear();
                        Ok(Progress::Step(Step::Line { kind, buf }))
                    }
                }
            }
            Step::Blob {
                kind,
                mut remaining,
                mut buf,
            } => {
                let take = remaining.min(self.buffer.len());
                let chunk = self.buffer.split_to(take);
                if buf.is_empty() {
                    buf = chunk;
                } else {
                    buf.extend_from_slice(&chunk);
                }
                remaining -= take;
                if remaining > 0 {
                    return Ok(Progress::Step(Step::Blob {
                        kind,
                        remaining,
                        buf,
                    }));
                }
                let value = self.finish_blob(kind, buf.freeze())?;
                Ok(Progress::Step(Step::Terminator { seen: 0, value }))
            }
            Step::Terminator { mut seen, value } => {
                while seen < 2 {
                    let Some(&byte) = self.buffer.first() else {
                        break;
                    };
                    if byte != crate::CRLF[seen] {
                        return Err(ProtocolError::ExpectedCrlf { found: byte });
                    }
                    self.buffer.advance(1);
                    seen += 1;
                }
                if seen == 2 {
                    Ok(Progress::Done(value))
                } else {
                    Ok(Progress::Step(Step::Terminator { seen, value }))
                }
            }
        }
    }

    /// Configuration for a value starting at the current position.
    fn child_config(&self) -> DecodeConfig {
        match self.stack.last() {
            None => self.shape.outer(),
            Some(frame) if self.stack.len() == 1 => self.shape.element(frame.filled),
            Some(frame) => frame.config,
        }
    }

    fn begin(&mut self, tag: u8, shape: &ReplyShape) -> Result<Progress, ProtocolError> {
        if self.stack.is_empty() {
            self.shape = match tag {
                b'>' => ReplyShape::Uniform(self.push_config),
                _ => shape.clone(),
            };
        }
        let mut config = self.child_config();
        let is_key = self.stack.last().is_some_and(Frame::expects_key);
        if is_key && matches!(tag, b'+' | b'$') {
            config.blob_string = BlobMode::Text;
        }
        self.config = config;

        let line = |kind| Step::Line {
            kind,
            buf: BytesMut::new(),
        };
        let length = |kind| Step::Number {
            digits: Digits::default(),
            target: NumberTarget::Length(kind),
        };

        let step = match tag {
            b'_' => Step::Terminator {
                seen: 0,
                value: ReplyValue::Null,
            },
            b'#' => Step::Boolean,
            b':' => Step::Number {
                digits: Digits::default(),
                target: NumberTarget::Integer,
            },
            b'(' => match config.big_number {
                BigNumberMode::Native => Step::BigNumber(BigDigits::default()),
                BigNumberMode::Text => line(LineKind::BigNumber),
            },
            b',' => match config.double {
                DoubleMode::Native => Step::Double(DoubleDigits::default()),
                DoubleMode::Text => line(LineKind::Double),
            },
            b'+' => line(LineKind::Simple),
            b'-' => line(LineKind::Error),
            b'$' => length(Prefixed::BlobString),
            b'=' => length(Prefixed::Verbatim),
            b'!' => length(Prefixed::BlobError),
            b'*' => length(Prefixed::Array),
            b'~' => length(Prefixed::Set),
            b'%' => length(Prefixed::Map),
            b'>' => length(Prefixed::Push),
            other => return Err(ProtocolError::InvalidTag(other)),
        };
        Ok(Progress::Step(step))
    }

    fn finish_number(&mut self, target: NumberTarget, n: i64) -> Result<Progress, ProtocolError> {
        let kind = match target {
            NumberTarget::Integer => return Ok(Progress::Done(ReplyValue::Integer(n))),
            NumberTarget::Length(kind) => kind,
        };
        if n == -1 && matches!(kind, Prefixed::BlobString | Prefixed::Array) {
            return Ok(Progress::Done(ReplyValue::Null));
        }
        let len = usize::try_from(n).map_err(|_| ProtocolError::InvalidLength(n))?;
        match kind {
            Prefixed::BlobString | Prefixed::BlobError | Prefixed::Verbatim => {
                Ok(Progress::Step(Step::Blob {
                    kind,
                    remaining: len,
                    buf: BytesMut::new(),
                }))
            }
            _ => {
                let frame = Frame::open(kind, len, self.config);
                if frame.remaining == 0 {
                    return Ok(Progress::Done(frame.finish()));
                }
                self.stack.push(frame);
                Ok(Progress::Step(Step::Tag))
            }
        }
    }

    fn finish_line(&self, kind: LineKind, bytes: Bytes) -> ReplyValue {
        match kind {
            LineKind::Simple => {
                ReplyValue::SimpleString(Blob::from_bytes(bytes, self.config.blob_string))
            }
            LineKind::Error => {
                ReplyValue::Error(ErrorReply::new(ErrorKind::Simple, lossy_text(bytes)))
            }
            LineKind::BigNumber => ReplyValue::BigNumber(BigNumber::Text(lossy_text(bytes))),
            LineKind::Double => ReplyValue::Double(Double::Text(lossy_text(bytes))),
        }
    }

    fn finish_blob(&self, kind: Prefixed, bytes: Bytes) -> Result<ReplyValue, ProtocolError> {
        match kind {
            Prefixed::BlobError => Ok(ReplyValue::Error(ErrorReply::new(
                ErrorKind::Blob,
                lossy_text(bytes),
            ))),
            Prefixed::Verbatim => {
                if bytes.len() < 4 || bytes[3] != b':' {
                    return Err(ProtocolError::InvalidVerbatim);
                }
                let format = lossy_text(bytes.slice(..3));
                let text = Blob::from_bytes(bytes.slice(4..), self.config.blob_string);
                Ok(ReplyValue::VerbatimString { format, text })
            }
            _ => Ok(ReplyValue::BlobString(Blob::from_bytes(
                bytes,
                self.config.blob_string,
            ))),
        }
    }

    /// Hands a finished value to its parent, closing every container it fills.
    /// Returns the top-level value once it is complete.
    fn complete(&mut self, mut value: ReplyValue) -> Option<ReplyValue> {
        loop {
            let frame = match self.stack.last_mut() {
                Some(frame) => frame,
                None => return Some(value),
            };
            frame.push(value);
            if frame.remaining > 0 {
                return None;
            }
            value = self.stack.pop()?.finish();
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn decode_all(input: &[u8]) -> Vec<Reply> {
        let mut decoder = Decoder::new();
        decoder.feed(input, &DecodeConfig::default()).unwrap()
    }

    fn decode_one(input: &[u8], config: DecodeConfig) -> ReplyValue {
        let mut decoder = Decoder::new();
        let mut replies = decoder.feed(input, &config).unwrap();
        assert_eq!(replies.len(), 1, "expected exactly one reply");
        replies.remove(0).into_value()
    }

    #[test]
    fn test_integer_split_across_chunks() {
        let mut decoder = Decoder::new();
        let config = DecodeConfig::default();

        assert!(decoder.feed(b":12", &config).unwrap().is_empty());
        assert!(!decoder.is_idle());

        let replies = decoder.feed(b"34\r\n", &config).unwrap();
        assert_eq!(replies, vec![Reply::Value(ReplyValue::Integer(1234))]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_simple_types() {
        let replies = decode_all(b"+OK\r\n:-42\r\n_\r\n#t\r\n#f\r\n$5\r\nhello\r\n$0\r\n\r\n");
        assert_eq!(
            replies,
            vec![
                Reply::Value(ReplyValue::simple("OK")),
                Reply::Value(ReplyValue::Integer(-42)),
                Reply::Value(ReplyValue::Null),
                Reply::Value(ReplyValue::Boolean(true)),
                Reply::Value(ReplyValue::Boolean(false)),
                Reply::Value(ReplyValue::text("hello")),
                Reply::Value(ReplyValue::text("")),
            ]
        );
    }

    #[test]
    fn test_legacy_nulls() {
        let replies = decode_all(b"*-1\r\n$-1\r\n");
        assert_eq!(
            replies,
            vec![Reply::Value(ReplyValue::Null), Reply::Value(ReplyValue::Null)]
        );
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut decoder = Decoder::new();
        let err = decoder.feed(b"~-1\r\n", &DecodeConfig::default()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidLength(-1));

        let mut decoder = Decoder::new();
        let err = decoder.feed(b"$-2\r\n", &DecodeConfig::default()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidLength(-2));
    }

    #[test]
    fn test_errors_are_classified() {
        let replies = decode_all(b"-ERR unknown command\r\n!21\r\nSYNTAX invalid syntax\r\n");
        assert_eq!(
            replies,
            vec![
                Reply::Error(ErrorReply::new(ErrorKind::Simple, "ERR unknown command")),
                Reply::Error(ErrorReply::new(ErrorKind::Blob, "SYNTAX invalid syntax")),
            ]
        );
    }

    #[test]
    fn test_nested_error_stays_a_value() {
        let replies = decode_all(b"*2\r\n:1\r\n-ERR nope\r\n");
        assert_eq!(
            replies,
            vec![Reply::Value(ReplyValue::Array(vec![
                ReplyValue::Integer(1),
                ReplyValue::Error(ErrorReply::new(ErrorKind::Simple, "ERR nope")),
            ]))]
        );
    }

    #[test]
    fn test_push_is_classified() {
        let replies = decode_all(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n");
        assert_eq!(
            replies,
            vec![Reply::Push(vec![
                ReplyValue::text("message"),
                ReplyValue::text("ch"),
                ReplyValue::text("hi"),
            ])]
        );
    }

    #[test]
    fn test_push_uses_push_config() {
        let mut decoder = Decoder::new();
        decoder.set_push_config(DecodeConfig::new().with_blob_string(BlobMode::Bytes));
        let replies = decoder
            .feed(b">2\r\n$7\r\nmessage\r\n$1\r\nx\r\n$1\r\ny\r\n", &DecodeConfig::default())
            .unwrap();
        assert_eq!(
            replies,
            vec![
                Reply::Push(vec![
                    ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"message"))),
                    ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"x"))),
                ]),
                Reply::Value(ReplyValue::text("y")),
            ]
        );
    }

    #[test]
    fn test_keyed_map_with_byte_values() {
        let config = DecodeConfig::new().with_blob_string(BlobMode::Bytes);
        let value = decode_one(b"%2\r\n+a\r\n:1\r\n$1\r\nb\r\n$3\r\nxyz\r\n", config);

        let mut expected = IndexMap::new();
        expected.insert("a".to_string(), ReplyValue::Integer(1));
        expected.insert(
            "b".to_string(),
            ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"xyz"))),
        );
        assert_eq!(value, ReplyValue::Map(MapReply::Keyed(expected)));
    }

    #[test]
    fn test_associative_map_keys_are_text() {
        let config = DecodeConfig::new()
            .with_blob_string(BlobMode::Bytes)
            .with_map(MapMode::Associative);
        let value = decode_one(b"%2\r\n$1\r\nk\r\n$1\r\nv\r\n:7\r\n_\r\n", config);

        let ReplyValue::Map(MapReply::Associative(map)) = value else {
            panic!("expected associative map");
        };
        assert_eq!(
            map.get(&ReplyValue::text("k")),
            Some(&ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"v"))))
        );
        assert_eq!(map.get(&ReplyValue::Integer(7)), Some(&ReplyValue::Null));
    }

    #[test]
    fn test_flat_map() {
        let config = DecodeConfig::new().with_map(MapMode::Flat);
        let value = decode_one(b"%1\r\n+k\r\n:1\r\n", config);
        assert_eq!(
            value,
            ReplyValue::Map(MapReply::Flat(vec![
                ReplyValue::simple("k"),
                ReplyValue::Integer(1)
            ]))
        );
    }

    #[test]
    fn test_keyed_map_stringifies_keys() {
        let value = decode_one(b"%1\r\n:5\r\n+five\r\n", DecodeConfig::default());
        let ReplyValue::Map(map) = value else {
            panic!("expected map");
        };
        assert_eq!(map.get("5"), Some(&ReplyValue::simple("five")));
    }

    #[test]
    fn test_unique_set_absorbs_duplicates() {
        let config = DecodeConfig::new().with_set(SetMode::Unique);
        let mut decoder = Decoder::new();
        let replies = decoder
            .feed(b"~3\r\n:1\r\n:1\r\n:2\r\n:9\r\n", &config)
            .unwrap();

        let expected: IndexSet<ReplyValue> = [ReplyValue::Integer(1), ReplyValue::Integer(2)]
            .into_iter()
            .collect();
        assert_eq!(
            replies,
            vec![
                Reply::Value(ReplyValue::Set(SetReply::Unique(expected))),
                Reply::Value(ReplyValue::Integer(9)),
            ]
        );
    }

    #[test]
    fn test_sequence_set_keeps_duplicates() {
        let value = decode_one(b"~2\r\n+a\r\n+a\r\n", DecodeConfig::default());
        assert_eq!(
            value,
            ReplyValue::Set(SetReply::Sequence(vec![
                ReplyValue::simple("a"),
                ReplyValue::simple("a")
            ]))
        );
    }

    #[test]
    fn test_empty_containers() {
        let replies = decode_all(b"*0\r\n%0\r\n~0\r\n");
        assert_eq!(
            replies,
            vec![
                Reply::Value(ReplyValue::Array(vec![])),
                Reply::Value(ReplyValue::Map(MapReply::Keyed(IndexMap::new()))),
                Reply::Value(ReplyValue::Set(SetReply::Sequence(vec![]))),
            ]
        );
    }

    #[test]
    fn test_doubles() {
        let config = DecodeConfig::default();
        assert_eq!(
            decode_one(b",1.5\r\n", config),
            ReplyValue::Double(Double::Native(1.5))
        );
        assert_eq!(
            decode_one(b",-0.25\r\n", config),
            ReplyValue::Double(Double::Native(-0.25))
        );
        assert_eq!(
            decode_one(b",10\r\n", config),
            ReplyValue::Double(Double::Native(10.0))
        );
        assert_eq!(
            decode_one(b",2e3\r\n", config),
            ReplyValue::Double(Double::Native(2000.0))
        );
        assert_eq!(
            decode_one(b",inf\r\n", config),
            ReplyValue::Double(Double::Native(f64::INFINITY))
        );
        assert_eq!(
            decode_one(b",-inf\r\n", config),
            ReplyValue::Double(Double::Native(f64::NEG_INFINITY))
        );

        let ReplyValue::Double(Double::Native(nan)) = decode_one(b",nan\r\n", config) else {
            panic!("expected double");
        };
        assert!(nan.is_nan());
    }

    #[test]
    fn test_double_precision() {
        let ReplyValue::Double(Double::Native(value)) =
            decode_one(b",12.34567\r\n", DecodeConfig::default())
        else {
            panic!("expected double");
        };
        assert!((value - 12.34567).abs() < 1e-12);
    }

    #[test]
    fn test_double_as_text() {
        let config = DecodeConfig::new().with_double(DoubleMode::Text);
        assert_eq!(
            decode_one(b",3.14\r\n", config),
            ReplyValue::Double(Double::Text("3.14".to_string()))
        );
    }

    #[test]
    fn test_big_numbers() {
        let literal = "3492890328409238509324850943850943825024385";
        let input = format!("({}\r\n", literal);

        let native = decode_one(input.as_bytes(), DecodeConfig::default());
        let expected: BigInt = literal.parse().unwrap();
        assert_eq!(native, ReplyValue::BigNumber(BigNumber::Native(expected)));

        let negative = decode_one(b"(-12\r\n", DecodeConfig::default());
        assert_eq!(
            negative,
            ReplyValue::BigNumber(BigNumber::Native(BigInt::from(-12)))
        );

        let config = DecodeConfig::new().with_big_number(BigNumberMode::Text);
        assert_eq!(
            decode_one(input.as_bytes(), config),
            ReplyValue::BigNumber(BigNumber::Text(literal.to_string()))
        );
    }

    #[test]
    fn test_verbatim_string() {
        let value = decode_one(b"=15\r\ntxt:Some string\r\n", DecodeConfig::default());
        assert_eq!(
            value,
            ReplyValue::VerbatimString {
                format: "txt".to_string(),
                text: Blob::from("Some string"),
            }
        );

        let mut decoder = Decoder::new();
        let err = decoder
            .feed(b"=3\r\ntxt\r\n", &DecodeConfig::default())
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidVerbatim);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let value = decode_one(b"$2\r\n\xff\xfe\r\n", DecodeConfig::default());
        assert_eq!(value, ReplyValue::text("\u{fffd}\u{fffd}"));
    }

    #[test]
    fn test_unknown_tag_poisons() {
        let mut decoder = Decoder::new();
        let err = decoder.feed(b"?oops\r\n", &DecodeConfig::default()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidTag(b'?'));
        assert!(decoder.is_poisoned());

        let err = decoder.feed(b"+OK\r\n", &DecodeConfig::default()).unwrap_err();
        assert_eq!(err, ProtocolError::Poisoned);

        decoder.reset();
        let replies = decoder.feed(b"+OK\r\n", &DecodeConfig::default()).unwrap();
        assert_eq!(replies, vec![Reply::Value(ReplyValue::simple("OK"))]);
    }

    #[test]
    fn test_missing_crlf() {
        let mut decoder = Decoder::new();
        let err = decoder
            .feed(b"$3\r\nabcXY", &DecodeConfig::default())
            .unwrap_err();
        assert_eq!(err, ProtocolError::ExpectedCrlf { found: b'X' });
    }

    #[test]
    fn test_invalid_digit() {
        let mut decoder = Decoder::new();
        let err = decoder.feed(b":12a\r\n", &DecodeConfig::default()).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidDigit { byte: b'a' });
    }

    #[test]
    fn test_integer_overflow() {
        let mut decoder = Decoder::new();
        let err = decoder
            .feed(b":99999999999999999999\r\n", &DecodeConfig::default())
            .unwrap_err();
        assert_eq!(err, ProtocolError::Overflow);
    }

    #[test]
    fn test_integer_extremes() {
        let replies = decode_all(b":-9223372036854775808\r\n:9223372036854775807\r\n");
        assert_eq!(
            replies,
            vec![
                Reply::Value(ReplyValue::Integer(i64::MIN)),
                Reply::Value(ReplyValue::Integer(i64::MAX)),
            ]
        );

        let mut decoder = Decoder::new();
        let err = decoder
            .feed(b":-9223372036854775809\r\n", &DecodeConfig::default())
            .unwrap_err();
        assert_eq!(err, ProtocolError::Overflow);
    }

    #[test]
    fn test_element_shape_applies_per_element() {
        let raw = DecodeConfig::new().with_blob_string(BlobMode::Bytes);
        let shape = ReplyShape::Elements {
            outer: DecodeConfig::default(),
            elements: Arc::from(vec![DecodeConfig::default(), raw]),
        };

        let mut decoder = Decoder::new();
        decoder.extend(b"*3\r\n$1\r\na\r\n$1\r\nb\r\n*1\r\n$1\r\nc\r\n");
        let reply = decoder.decode_next(&shape).unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Value(ReplyValue::Array(vec![
                ReplyValue::text("a"),
                ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"b"))),
                ReplyValue::Array(vec![ReplyValue::text("c")]),
            ]))
        );
    }

    #[test]
    fn test_shape_captured_at_top_level_tag() {
        let raw = ReplyShape::Uniform(DecodeConfig::new().with_blob_string(BlobMode::Bytes));
        let text = ReplyShape::default();

        let mut decoder = Decoder::new();
        decoder.extend(b"*2\r\n$1\r\na\r\n");
        assert!(decoder.decode_next(&raw).unwrap().is_none());

        // A different shape mid-value is ignored.
        decoder.extend(b"$1\r\nb\r\n");
        let reply = decoder.decode_next(&text).unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Value(ReplyValue::Array(vec![
                ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"a"))),
                ReplyValue::BlobString(Blob::Bytes(Bytes::from_static(b"b"))),
            ]))
        );
    }

    #[test]
    fn test_reset_mid_value() {
        let mut decoder = Decoder::new();
        decoder.feed(b"*2\r\n:1\r\n", &DecodeConfig::default()).unwrap();
        assert!(!decoder.is_idle());
        decoder.reset();
        assert!(decoder.is_idle());
        assert_eq!(decoder.buffered(), 0);
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"+OK\r\n:-1234567\r\n$11\r\nhello world\r\n");
        stream.extend_from_slice(b"*3\r\n:1\r\n*2\r\n+a\r\n$-1\r\n%1\r\n+k\r\n~2\r\n#t\r\n_\r\n");
        stream.extend_from_slice(b",-12.375\r\n,inf\r\n(-98765432109876543210\r\n");
        stream.extend_from_slice(b"=9\r\ntxt:hello\r\n>2\r\n+pong\r\n!3\r\nERR\r\n");
        stream.extend_from_slice(b"-WRONGTYPE bad\r\n*-1\r\n%0\r\n");
        stream
    }

    fn sample_configs() -> [DecodeConfig; 3] {
        [
            DecodeConfig::default(),
            DecodeConfig::new()
                .with_blob_string(BlobMode::Bytes)
                .with_big_number(BigNumberMode::Text)
                .with_double(DoubleMode::Text)
                .with_set(SetMode::Unique)
                .with_map(MapMode::Associative),
            DecodeConfig::new()
                .with_blob_string(BlobMode::Bytes)
                .with_set(SetMode::Unique)
                .with_map(MapMode::Flat),
        ]
    }

    proptest! {
        #[test]
        fn test_chunking_matches_whole_buffer(
            splits in prop::collection::vec(1usize..16, 1..64),
            which in 0usize..3
        ) {
            let stream = sample_stream();
            let config = sample_configs()[which];
            let expected = Decoder::new().feed(&stream, &config).unwrap();

            let mut decoder = Decoder::new();
            let mut replies = Vec::new();
            let mut offset = 0;
            let mut sizes = splits.iter().cycle();
            while offset < stream.len() {
                let size = (*sizes.next().unwrap()).min(stream.len() - offset);
                replies.extend(decoder.feed(&stream[offset..offset + size], &config).unwrap());
                offset += size;
            }

            prop_assert_eq!(replies, expected);
            prop_assert!(decoder.is_idle());
        }

        #[test]
        fn test_integers_roundtrip_any_split(value in any::<i64>(), split in 0usize..24) {
            let input = format!(":{}\r\n", value);
            let split = split.min(input.len());
            let mut decoder = Decoder::new();
            let mut replies = decoder.feed(&input.as_bytes()[..split], &DecodeConfig::default()).unwrap();
            replies.extend(decoder.feed(&input.as_bytes()[split..], &DecodeConfig::default()).unwrap());
            prop_assert_eq!(replies, vec![Reply::Value(ReplyValue::Integer(value))]);
        }
    }

    #[test]
    fn test_single_byte_chunks() {
        let stream = sample_stream();
        let config = DecodeConfig::default();
        let expected = Decoder::new().feed(&stream, &config).unwrap();
        assert_eq!(expected.len(), 13);

        let mut decoder = Decoder::new();
        let mut replies = Vec::new();
        for byte in &stream {
            replies.extend(decoder.feed(std::slice::from_ref(byte), &config).unwrap());
        }
        assert_eq!(replies, expected);
    }
}
