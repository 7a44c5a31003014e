use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::codec::value::Value;
use crate::util::buf::{put_string_u16, try_get_bytes, try_get_string_u16};

/// A call request carried in a frame with the call opcode:
///  `u16 idLen | id | u16 pathLen | path | u16 n | n x Value`.
///
/// The path is either a plain command name or the structured form
///  `rpc:<interfaceName>:<methodName>:<methodId>:<interfaceId>`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub invocation_id: String,
    pub path: String,
    pub params: Vec<Value>,
}

impl CallEnvelope {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_string_u16(buf, &self.invocation_id)?;
        put_string_u16(buf, &self.path)?;
        let Ok(count) = u16::try_from(self.params.len()) else {
            bail!("{} call parameters exceed the u16 count prefix", self.params.len());
        };
        buf.put_u16(count);
        for param in &self.params {
            param.ser(buf);
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CallEnvelope> {
        let invocation_id = try_get_string_u16(buf)?;
        let path = try_get_string_u16(buf)?;
        let params = try_deser_params(buf)?;
        Ok(CallEnvelope {
            invocation_id,
            path,
            params,
        })
    }
}

pub fn try_deser_params(buf: &mut impl Buf) -> anyhow::Result<Vec<Value>> {
    let count = buf.try_get_u16()? as usize;
    let mut params = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        params.push(Value::try_deser(buf)?);
    }
    Ok(params)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Success(Value),
    /// diagnostic text from the remote side
    Failure(String),
}

const OUTCOME_SUCCESS: i8 = 1;
const OUTCOME_FAILURE: i8 = -1;

/// A call reply carried in a frame with the reply opcode:
///  `u16 idLen | id | u16 pathLen | path | i8 outcome | Value`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub invocation_id: String,
    pub path: String,
    pub outcome: ReplyOutcome,
}

impl ReplyEnvelope {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        put_string_u16(buf, &self.invocation_id)?;
        put_string_u16(buf, &self.path)?;
        match &self.outcome {
            ReplyOutcome::Success(value) => {
                buf.put_i8(OUTCOME_SUCCESS);
                value.ser(buf);
            }
            ReplyOutcome::Failure(info) => {
                buf.put_i8(OUTCOME_FAILURE);
                Value::Str(info.clone()).ser(buf);
            }
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ReplyEnvelope> {
        let invocation_id = try_get_string_u16(buf)?;
        let path = try_get_string_u16(buf)?;
        let outcome_tag = buf.try_get_i8()?;
        let value = Value::try_deser(buf)?;
        let outcome = match outcome_tag {
            OUTCOME_SUCCESS => ReplyOutcome::Success(value),
            OUTCOME_FAILURE => ReplyOutcome::Failure(failure_info(value)),
            n => bail!("invalid reply outcome tag: {}", n),
        };
        Ok(ReplyEnvelope {
            invocation_id,
            path,
            outcome,
        })
    }
}

/// A failure value is normally a string, but peers may send raw diagnostic
///  bytes (e.g. a dumped stack trace).
fn failure_info(value: Value) -> String {
    match value {
        Value::Str(s) => s,
        Value::ByteArray(bytes) => {
            let bytes: Vec<u8> = bytes.into_iter().map(|b| b as u8).collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Value::Opaque(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Null => String::new(),
        other => format!("{:?}", other),
    }
}

/// Error notification payload, carried in a frame with the error opcode:
///  `i32 triggeringOpcode | u8 errorLevel | i32 errorCode | i32 infoLen | info`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorNotification {
    pub trigger_opcode: i32,
    pub level: u8,
    pub code: i32,
    pub info: String,
}

impl ErrorNotification {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32(self.trigger_opcode);
        buf.put_u8(self.level);
        buf.put_i32(self.code);
        buf.put_u32(self.info.len() as u32);
        buf.put_slice(self.info.as_bytes());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ErrorNotification> {
        let trigger_opcode = buf.try_get_i32()?;
        let level = buf.try_get_u8()?;
        let code = buf.try_get_i32()?;
        let info_len = buf.try_get_u32()? as usize;
        let info = String::from_utf8(try_get_bytes(buf, info_len)?)?;
        Ok(ErrorNotification {
            trigger_opcode,
            level,
            code,
            info,
        })
    }
}
