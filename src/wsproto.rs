use anyhow::Result;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const WS_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Size cap for inline `FileWrite` content; larger files go over HTTP.
pub const INLINE_WRITE_MAX_BYTES: usize = 1024 * 1024;

const MAGIC0: u8 = b'S';
const MAGIC1: u8 = b'B';
const VERSION: u8 = 1;

pub const MSG_SYSTEM: u16 = 1;
pub const MSG_FILE_WRITE: u16 = 2;
pub const MSG_FILE_DELETE: u16 = 3;
pub const MSG_ERROR: u16 = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Json,
    MsgPack,
}

impl Encoding {
    pub fn as_byte(self) -> u8 {
        match self {
            Encoding::Json => 0,
            Encoding::MsgPack => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemMsg {
    pub system_version: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ErrorMsg {
    pub code: i32,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct FileWriteMsg {
    pub path: String,
    pub etag: String,
    pub length: i64,
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct FileDeleteMsg {
    pub path: String,
}

#[derive(Debug)]
pub enum Decoded {
    System(SystemMsg),
    Error(ErrorMsg),
    FileWrite(FileWriteMsg),
    FileDelete(FileDeleteMsg),
    Other { id: String, typ: u16 },
}

// Text frames use compact field tags.
#[derive(Debug, Deserialize)]
struct JsonEnvelope {
    pub id: String,
    #[serde(rename = "typ")]
    pub typ: u16,
    #[serde(rename = "dat")]
    pub dat: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonSystem {
    #[serde(rename = "sv", default)]
    pub system_version: String,
    #[serde(rename = "msg", default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct JsonError {
    #[serde(rename = "cod")]
    pub code: i32,
    #[serde(rename = "pth", default)]
    pub path: String,
    #[serde(rename = "msg", default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct JsonFileWrite {
    #[serde(rename = "pth")]
    pub path: String,
    #[serde(rename = "etg")]
    pub etag: String,
    #[serde(rename = "len")]
    pub length: i64,
    #[serde(rename = "con", default, deserialize_with = "deserialize_base64_opt")]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct JsonFileDelete {
    #[serde(rename = "pth")]
    pub path: String,
}

// Binary frames carry msgpack with exported field names.
#[derive(Debug, Deserialize)]
struct MsgpackSystem {
    #[serde(rename = "SystemVersion", default)]
    pub system_version: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct MsgpackError {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgpackFileWrite {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Length")]
    pub length: i64,
    #[serde(rename = "Content", default)]
    pub content: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct MsgpackFileDelete {
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct WireMessage {
    pub id: String,
    #[serde(rename = "typ")]
    pub typ: u16,
    #[serde(rename = "dat")]
    pub dat: Vec<u8>,
}

pub fn encode_msgpack<T: Serialize>(id: &str, typ: u16, dat: &T) -> Result<Vec<u8>> {
    let dat_bytes = rmp_serde::to_vec_named(dat)?;
    let wire = WireMessage {
        id: id.to_string(),
        typ,
        dat: dat_bytes,
    };
    let payload = rmp_serde::to_vec_named(&wire)?;

    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(Encoding::MsgPack.as_byte());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Frame for an inline priority upload.
pub fn encode_file_write(id: &str, msg: &FileWriteMsg) -> Result<Vec<u8>> {
    encode_msgpack(
        id,
        MSG_FILE_WRITE,
        &MsgpackFileWrite {
            path: msg.path.clone(),
            etag: msg.etag.clone(),
            length: msg.length,
            content: msg.content.clone(),
        },
    )
}

pub fn decode_text_json(raw: &str) -> Result<Decoded> {
    let msg: JsonEnvelope = serde_json::from_str(raw)?;
    decode_json_msg(msg)
}

pub fn decode_binary(raw: &[u8]) -> Result<Decoded> {
    if raw.len() >= 4 && raw[0] == MAGIC0 && raw[1] == MAGIC1 {
        if raw[2] != VERSION {
            anyhow::bail!("unsupported ws envelope version: {}", raw[2]);
        }
        let enc = raw[3];
        let payload = &raw[4..];
        match enc {
            1 => decode_msgpack(payload),
            0 => {
                let txt = std::str::from_utf8(payload)?;
                decode_text_json(txt)
            }
            _ => anyhow::bail!("unknown ws encoding: {}", enc),
        }
    } else {
        // Legacy binary frames are treated as UTF-8 JSON (best effort).
        let txt = std::str::from_utf8(raw)?;
        decode_text_json(txt)
    }
}

fn decode_msgpack(payload: &[u8]) -> Result<Decoded> {
    let wire: WireMessage = rmp_serde::from_slice(payload)?;
    match wire.typ {
        MSG_SYSTEM => {
            let m: MsgpackSystem = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::System(SystemMsg {
                system_version: m.system_version,
                message: m.message,
            }))
        }
        MSG_ERROR => {
            let m: MsgpackError = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::Error(ErrorMsg {
                code: m.code,
                path: m.path,
                message: m.message,
            }))
        }
        MSG_FILE_WRITE => {
            let m: MsgpackFileWrite = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::FileWrite(FileWriteMsg {
                path: m.path,
                etag: m.etag,
                length: m.length,
                content: m.content,
            }))
        }
        MSG_FILE_DELETE => {
            let m: MsgpackFileDelete = rmp_serde::from_slice(&wire.dat)?;
            Ok(Decoded::FileDelete(FileDeleteMsg { path: m.path }))
        }
        _ => Ok(Decoded::Other {
            id: wire.id,
            typ: wire.typ,
        }),
    }
}

fn decode_json_msg(msg: JsonEnvelope) -> Result<Decoded> {
    match msg.typ {
        MSG_SYSTEM => {
            let m: JsonSystem = serde_json::from_value(msg.dat)?;
            Ok(Decoded::System(SystemMsg {
                system_version: m.system_version,
                message: m.message,
            }))
        }
        MSG_ERROR => {
            let m: JsonError = serde_json::from_value(msg.dat)?;
            Ok(Decoded::Error(ErrorMsg {
                code: m.code,
                path: m.path,
                message: m.message,
            }))
        }
        MSG_FILE_WRITE => {
            let m: JsonFileWrite = serde_json::from_value(msg.dat)?;
            Ok(Decoded::FileWrite(FileWriteMsg {
                path: m.path,
                etag: m.etag,
                length: m.length,
                content: m.content,
            }))
        }
        MSG_FILE_DELETE => {
            let m: JsonFileDelete = serde_json::from_value(msg.dat)?;
            Ok(Decoded::FileDelete(FileDeleteMsg { path: m.path }))
        }
        _ => Ok(Decoded::Other {
            id: msg.id,
            typ: msg.typ,
        }),
    }
}

fn deserialize_base64_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt = Option::<serde_json::Value>::deserialize(deserializer)?;
    match opt {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom)?;
            Ok(Some(bytes))
        }
        Some(serde_json::Value::Array(arr)) => {
            let mut out = Vec::with_capacity(arr.len());
            for v in arr {
                let n = v
                    .as_u64()
                    .ok_or_else(|| serde::de::Error::custom("expected byte"))?;
                out.push(n as u8);
            }
            Ok(Some(out))
        }
        _ => Err(serde::de::Error::custom(
            "expected base64 string or array for bytes",
        )),
    }
}
