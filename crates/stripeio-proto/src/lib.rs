//! stripeio wire protocol
//!
//! Fixed-size request/reply headers prefixed by a magic constant; the `id`
//! field correlates replies to requests. Each opcode's variable-length
//! payload (data buffers for reads and writes, object/version arrays for
//! stabilize and rollback) follows its header.
//!
//! Message format:
//! ```text
//! request:  +-------+----+--------+----------------+---------+
//!           | magic | id | opcode | op args (32B)  | payload |
//!           | 8B    | 8B | 8B     |                | var     |
//!           +-------+----+--------+----------------+---------+
//! reply:    +-------+----+--------+--------+-------------+---------+
//!           | magic | id | opcode | retval | payload len | payload |
//!           | 8B    | 8B | 8B     | 8B     | 8B + 8B aux | var     |
//!           +-------+----+--------+--------+-------------+---------+
//! ```

pub mod messenger;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use stripeio_common::{Error, ObjVer, Oid, Result};

pub use messenger::Messenger;

/// Magic prefix of every request header.
pub const OSD_OP_MAGIC: u64 = 0x7374_7269_7065_6f70; // "stripeop"
/// Magic prefix of every reply header.
pub const OSD_REPLY_MAGIC: u64 = 0x7374_7269_7065_7270; // "striperp"

pub const REQUEST_HEADER_SIZE: usize = 56;
pub const REPLY_HEADER_SIZE: usize = 48;

/// Alignment required of client read/write offsets and lengths.
pub const WIRE_ALIGN: u64 = 512;

/// Upper bound on a single read/write payload.
pub const MAX_RW_LEN: u64 = 32 * 1024 * 1024;

/// Encoded size of one (oid, version) pair in stabilize/rollback payloads.
pub const OBJ_VER_SIZE: usize = 24;

/// The closed set of operations an OSD accepts. Client-facing operations
/// run the primary pipeline; `Sec*` operations map directly onto the
/// local blockstore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Opcode {
    Read = 1,
    Write = 2,
    Sync = 3,
    Delete = 4,
    SecRead = 5,
    SecWrite = 6,
    SecWriteStable = 7,
    SecSync = 8,
    SecStabilize = 9,
    SecRollback = 10,
    SecList = 11,
    SecReadBmp = 12,
    ShowConfig = 13,
}

impl Opcode {
    pub fn from_u64(v: u64) -> Option<Self> {
        match v {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::Sync),
            4 => Some(Self::Delete),
            5 => Some(Self::SecRead),
            6 => Some(Self::SecWrite),
            7 => Some(Self::SecWriteStable),
            8 => Some(Self::SecSync),
            9 => Some(Self::SecStabilize),
            10 => Some(Self::SecRollback),
            11 => Some(Self::SecList),
            12 => Some(Self::SecReadBmp),
            13 => Some(Self::ShowConfig),
        _ => None,
        }
    }
}

/// Arguments shared by read and write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RwArgs {
    pub oid: Oid,
    pub version: u64,
    pub offset: u32,
    pub len: u32,
}

/// A decoded request. The discriminant set is closed, so every dispatch
/// site handles the full opcode range or does not compile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsdRequest {
    Read(RwArgs),
    Write { args: RwArgs, data: Bytes },
    Sync,
    Delete { oid: Oid, version: u64 },
    SecRead(RwArgs),
    SecWrite { args: RwArgs, data: Bytes },
    /// Write that becomes stable as soon as it is synced (INSTANT).
    SecWriteStable { args: RwArgs, data: Bytes },
    SecSync,
    SecStabilize { versions: Vec<ObjVer> },
    SecRollback { versions: Vec<ObjVer> },
    SecList {
        pg_count: u32,
        pg_num: u32,
        pg_stripe_size: u64,
    },
    /// Report the current version of each listed object.
    SecReadBmp { oids: Vec<Oid> },
    ShowConfig,
}

impl OsdRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Read(_) => Opcode::Read,
            Self::Write { .. } => Opcode::Write,
            Self::Sync => Opcode::Sync,
            Self::Delete { .. } => Opcode::Delete,
            Self::SecRead(_) => Opcode::SecRead,
            Self::SecWrite { .. } => Opcode::SecWrite,
            Self::SecWriteStable { .. } => Opcode::SecWriteStable,
            Self::SecSync => Opcode::SecSync,
            Self::SecStabilize { .. } => Opcode::SecStabilize,
            Self::SecRollback { .. } => Opcode::SecRollback,
            Self::SecList { .. } => Opcode::SecList,
            Self::SecReadBmp { .. } => Opcode::SecReadBmp,
            Self::ShowConfig => Opcode::ShowConfig,
        }
    }

    /// Framing validation per the dispatcher contract: block-aligned
    /// offsets and lengths, capped sizes. Violations are surfaced to the
    /// client without dropping the connection.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Read(args) | Self::SecRead(args) => validate_rw(args, None),
            Self::Write { args, data }
            | Self::SecWrite { args, data }
            | Self::SecWriteStable { args, data } => validate_rw(args, Some(data.len())),
            _ => Ok(()),
        }
    }

    /// Encode into a header plus payload, ready for framing.
    pub fn encode(&self, id: u64) -> (BytesMut, Bytes) {
        let mut h = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
        h.put_u64_le(OSD_OP_MAGIC);
        h.put_u64_le(id);
        h.put_u64_le(self.opcode() as u64);

        let payload: Bytes = match self {
            Self::Read(args) | Self::SecRead(args) => {
                put_rw_args(&mut h, args);
                Bytes::new()
            }
            Self::Write { args, data }
            | Self::SecWrite { args, data }
            | Self::SecWriteStable { args, data } => {
                put_rw_args(&mut h, args);
                data.clone()
            }
            Self::Sync | Self::SecSync | Self::ShowConfig => {
                h.put_bytes(0, 32);
                Bytes::new()
            }
            Self::Delete { oid, version } => {
                h.put_u64_le(oid.inode);
                h.put_u64_le(oid.stripe);
                h.put_u64_le(*version);
                h.put_u64_le(0);
                Bytes::new()
            }
            Self::SecStabilize { versions } | Self::SecRollback { versions } => {
                let payload = encode_obj_vers(versions);
                h.put_u64_le(payload.len() as u64);
                h.put_bytes(0, 24);
                payload
            }
            Self::SecList {
                pg_count,
                pg_num,
                pg_stripe_size,
            } => {
                h.put_u32_le(*pg_count);
                h.put_u32_le(*pg_num);
                h.put_u64_le(*pg_stripe_size);
                h.put_bytes(0, 16);
                Bytes::new()
            }
            Self::SecReadBmp { oids } => {
                let mut p = BytesMut::with_capacity(oids.len() * 16);
                for oid in oids {
                    p.put_u64_le(oid.inode);
                    p.put_u64_le(oid.stripe);
                }
                h.put_u64_le(p.len() as u64);
                h.put_bytes(0, 24);
                p.freeze()
            }
        };
        debug_assert_eq!(h.len(), REQUEST_HEADER_SIZE);
        (h, payload)
    }

    /// Parse a request header, returning the id, opcode and the number of
    /// payload bytes that follow.
    pub fn decode_header(header: &[u8]) -> Result<(u64, Opcode, usize)> {
        if header.len() < REQUEST_HEADER_SIZE {
            return Err(Error::invalid_input("short request header"));
        }
        let mut r = header;
        let magic = r.get_u64_le();
        if magic != OSD_OP_MAGIC {
            return Err(Error::invalid_input(format!(
                "bad request magic {magic:#x}"
            )));
        }
        let id = r.get_u64_le();
        let opcode_raw = r.get_u64_le();
        let opcode = Opcode::from_u64(opcode_raw)
            .ok_or_else(|| Error::invalid_input(format!("unknown opcode {opcode_raw}")))?;

        let payload_len = match opcode {
            Opcode::Write | Opcode::SecWrite | Opcode::SecWriteStable => {
                // len field of the rw args
                let mut a = r;
                a.advance(28);
                a.get_u32_le() as usize
            }
            Opcode::SecStabilize | Opcode::SecRollback | Opcode::SecReadBmp => {
                let mut a = r;
                a.get_u64_le() as usize
            }
            _ => 0,
        };
        if payload_len as u64 > MAX_RW_LEN {
            return Err(Error::invalid_input(format!(
                "payload of {payload_len} bytes exceeds the cap"
            )));
        }
        Ok((id, opcode, payload_len))
    }

    /// Decode a full request from its header and payload.
    pub fn decode(header: &[u8], payload: Bytes) -> Result<(u64, OsdRequest)> {
        let (id, opcode, payload_len) = Self::decode_header(header)?;
        if payload.len() != payload_len {
            return Err(Error::invalid_input(format!(
                "payload length mismatch: header says {payload_len}, got {}",
                payload.len()
            )));
        }
        let mut r = &header[24..];

        let req = match opcode {
            Opcode::Read => OsdRequest::Read(get_rw_args(&mut r)),
            Opcode::SecRead => OsdRequest::SecRead(get_rw_args(&mut r)),
            Opcode::Write => OsdRequest::Write {
                args: get_rw_args(&mut r),
                data: payload,
            },
            Opcode::SecWrite => OsdRequest::SecWrite {
                args: get_rw_args(&mut r),
                data: payload,
            },
            Opcode::SecWriteStable => OsdRequest::SecWriteStable {
                args: get_rw_args(&mut r),
                data: payload,
            },
            Opcode::Sync => OsdRequest::Sync,
            Opcode::SecSync => OsdRequest::SecSync,
            Opcode::ShowConfig => OsdRequest::ShowConfig,
            Opcode::Delete => {
                let oid = Oid::new(r.get_u64_le(), r.get_u64_le());
                OsdRequest::Delete {
                    oid,
                    version: r.get_u64_le(),
                }
            }
            Opcode::SecStabilize => OsdRequest::SecStabilize {
                versions: decode_obj_vers(&payload)?,
            },
            Opcode::SecRollback => OsdRequest::SecRollback {
                versions: decode_obj_vers(&payload)?,
            },
            Opcode::SecList => OsdRequest::SecList {
                pg_count: r.get_u32_le(),
                pg_num: r.get_u32_le(),
                pg_stripe_size: r.get_u64_le(),
            },
            Opcode::SecReadBmp => {
                if payload.len() % 16 != 0 {
                    return Err(Error::invalid_input("malformed object id array"));
                }
                let mut p = &payload[..];
                let mut oids = Vec::with_capacity(payload.len() / 16);
                while p.has_remaining() {
                    oids.push(Oid::new(p.get_u64_le(), p.get_u64_le()));
                }
                OsdRequest::SecReadBmp { oids }
            }
        };
        Ok((id, req))
    }
}

fn validate_rw(args: &RwArgs, data_len: Option<usize>) -> Result<()> {
    if u64::from(args.len) > MAX_RW_LEN {
        return Err(Error::invalid_input(format!(
            "length {} exceeds the {MAX_RW_LEN} byte cap",
            args.len
        )));
    }
    if u64::from(args.offset) % WIRE_ALIGN != 0 || u64::from(args.len) % WIRE_ALIGN != 0 {
        return Err(Error::invalid_input(format!(
            "offset {} / length {} not aligned to {WIRE_ALIGN}",
            args.offset, args.len
        )));
    }
    if let Some(n) = data_len {
        if n != args.len as usize {
            return Err(Error::invalid_input(format!(
                "data length {n} does not match header length {}",
                args.len
            )));
        }
    }
    Ok(())
}

fn put_rw_args(h: &mut BytesMut, args: &RwArgs) {
    h.put_u64_le(args.oid.inode);
    h.put_u64_le(args.oid.stripe);
    h.put_u64_le(args.version);
    h.put_u32_le(args.offset);
    h.put_u32_le(args.len);
}

fn get_rw_args(r: &mut &[u8]) -> RwArgs {
    RwArgs {
        oid: Oid::new(r.get_u64_le(), r.get_u64_le()),
        version: r.get_u64_le(),
        offset: r.get_u32_le(),
        len: r.get_u32_le(),
    }
}

pub fn encode_obj_vers(versions: &[ObjVer]) -> Bytes {
    let mut p = BytesMut::with_capacity(versions.len() * OBJ_VER_SIZE);
    for ov in versions {
        p.put_u64_le(ov.oid.inode);
        p.put_u64_le(ov.oid.stripe);
        p.put_u64_le(ov.version);
    }
    p.freeze()
}

pub fn decode_obj_vers(payload: &[u8]) -> Result<Vec<ObjVer>> {
    if payload.len() % OBJ_VER_SIZE != 0 {
        return Err(Error::invalid_input("malformed object version array"));
    }
    let mut r = payload;
    let mut out = Vec::with_capacity(payload.len() / OBJ_VER_SIZE);
    while r.has_remaining() {
        out.push(ObjVer::new(
            Oid::new(r.get_u64_le(), r.get_u64_le()),
            r.get_u64_le(),
        ));
    }
    Ok(out)
}

/// A decoded reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsdReply {
    /// Generic acknowledgement; negative `retval` is an error code, for
    /// writes a non-negative value is the assigned version.
    Ack { retval: i64 },
    /// Read data (retval is the byte count, or negative on error).
    Data { retval: i64, data: Bytes },
    /// SEC_LIST result: stable versions first, then unstable ones.
    ObjectList {
        stable: Vec<ObjVer>,
        unstable: Vec<ObjVer>,
    },
    /// SEC_READ_BMP result: the newest version per requested object.
    VersionList { versions: Vec<ObjVer> },
    /// SHOW_CONFIG result.
    Config { json: String },
}

impl OsdReply {
    pub fn retval(&self) -> i64 {
        match self {
            Self::Ack { retval } | Self::Data { retval, .. } => *retval,
            Self::ObjectList { .. } | Self::VersionList { .. } | Self::Config { .. } => 0,
        }
    }

    pub fn encode(&self, id: u64, opcode: Opcode) -> (BytesMut, Bytes) {
        let mut h = BytesMut::with_capacity(REPLY_HEADER_SIZE);
        h.put_u64_le(OSD_REPLY_MAGIC);
        h.put_u64_le(id);
        h.put_u64_le(opcode as u64);

        let (retval, aux, payload): (i64, u64, Bytes) = match self {
            Self::Ack { retval } => (*retval, 0, Bytes::new()),
            Self::Data { retval, data } => (*retval, 0, data.clone()),
            Self::ObjectList { stable, unstable } => {
                let mut all = stable.clone();
                all.extend_from_slice(unstable);
                ((stable.len() + unstable.len()) as i64, stable.len() as u64, encode_obj_vers(&all))
            }
            Self::VersionList { versions } => {
                (versions.len() as i64, 0, encode_obj_vers(versions))
            }
            Self::Config { json } => (json.len() as i64, 0, Bytes::from(json.clone().into_bytes())),
        };
        h.put_i64_le(retval);
        h.put_u64_le(payload.len() as u64);
        h.put_u64_le(aux);
        debug_assert_eq!(h.len(), REPLY_HEADER_SIZE);
        (h, payload)
    }

    /// Parse a reply header: (id, opcode, retval, payload_len, aux).
    pub fn decode_header(header: &[u8]) -> Result<(u64, Opcode, i64, usize, u64)> {
        if header.len() < REPLY_HEADER_SIZE {
            return Err(Error::invalid_input("short reply header"));
        }
        let mut r = header;
        let magic = r.get_u64_le();
        if magic != OSD_REPLY_MAGIC {
            return Err(Error::invalid_input(format!("bad reply magic {magic:#x}")));
        }
        let id = r.get_u64_le();
        let opcode_raw = r.get_u64_le();
        let opcode = Opcode::from_u64(opcode_raw)
            .ok_or_else(|| Error::invalid_input(format!("unknown opcode {opcode_raw}")))?;
        let retval = r.get_i64_le();
        let payload_len = r.get_u64_le() as usize;
        let aux = r.get_u64_le();
        Ok((id, opcode, retval, payload_len, aux))
    }

    pub fn decode(header: &[u8], payload: Bytes) -> Result<(u64, OsdReply)> {
        let (id, opcode, retval, payload_len, aux) = Self::decode_header(header)?;
        if payload.len() != payload_len {
            return Err(Error::invalid_input("reply payload length mismatch"));
        }
        let reply = match opcode {
            Opcode::Read | Opcode::SecRead => OsdReply::Data {
                retval,
                data: payload,
            },
            Opcode::SecList => {
                let all = decode_obj_vers(&payload)?;
                let stable_count = aux as usize;
                if stable_count > all.len() {
                    return Err(Error::invalid_input("stable count exceeds list length"));
                }
                let unstable = all[stable_count..].to_vec();
                let stable = all[..stable_count].to_vec();
                OsdReply::ObjectList { stable, unstable }
            }
            Opcode::SecReadBmp => OsdReply::VersionList {
                versions: decode_obj_vers(&payload)?,
            },
            Opcode::ShowConfig => OsdReply::Config {
                json: String::from_utf8(payload.to_vec())
                    .map_err(|_| Error::invalid_input("config reply is not UTF-8"))?,
            },
            _ => OsdReply::Ack { retval },
        };
        Ok((id, reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: OsdRequest) -> OsdRequest {
        let (h, p) = req.encode(77);
        let (id, decoded) = OsdRequest::decode(&h, p).unwrap();
        assert_eq!(id, 77);
        decoded
    }

    #[test]
    fn test_write_roundtrip() {
        let req = OsdRequest::SecWrite {
            args: RwArgs {
                oid: Oid::new(0x10, 0x40000),
                version: 9,
                offset: 512,
                len: 1024,
            },
            data: Bytes::from(vec![0xab; 1024]),
        };
        assert_eq!(roundtrip_request(req.clone()), req);
    }

    #[test]
    fn test_stabilize_roundtrip() {
        let versions = vec![
            ObjVer::new(Oid::new(1, 0), 3),
            ObjVer::new(Oid::new(1, 4096), 7),
        ];
        let req = OsdRequest::SecStabilize {
            versions: versions.clone(),
        };
        match roundtrip_request(req) {
            OsdRequest::SecStabilize { versions: v } => assert_eq!(v, versions),
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let req = OsdRequest::Sync;
        let (mut h, p) = req.encode(1);
        h[0] ^= 0xff;
        assert!(OsdRequest::decode(&h, p).is_err());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let (mut h, p) = OsdRequest::Sync.encode(1);
        h[16..24].copy_from_slice(&999u64.to_le_bytes());
        assert!(OsdRequest::decode(&h, p).is_err());
    }

    #[test]
    fn test_alignment_validation() {
        let ok = OsdRequest::Read(RwArgs {
            oid: Oid::new(1, 0),
            version: 0,
            offset: 512,
            len: 4096,
        });
        assert!(ok.validate().is_ok());

        let bad = OsdRequest::Read(RwArgs {
            oid: Oid::new(1, 0),
            version: 0,
            offset: 100,
            len: 4096,
        });
        assert!(bad.validate().is_err());

        let too_big = OsdRequest::Read(RwArgs {
            oid: Oid::new(1, 0),
            version: 0,
            offset: 0,
            len: (MAX_RW_LEN + 512) as u32,
        });
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_list_reply_roundtrip() {
        let reply = OsdReply::ObjectList {
            stable: vec![ObjVer::new(Oid::new(1, 0), 1)],
            unstable: vec![
                ObjVer::new(Oid::new(1, 4096), 2),
                ObjVer::new(Oid::new(2, 0), 5),
            ],
        };
        let (h, p) = reply.encode(42, Opcode::SecList);
        let (id, decoded) = OsdReply::decode(&h, p).unwrap();
        assert_eq!(id, 42);
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_payload_length_mismatch() {
        let req = OsdRequest::SecWrite {
            args: RwArgs {
                oid: Oid::new(1, 0),
                version: 1,
                offset: 0,
                len: 1024,
            },
            data: Bytes::from(vec![0u8; 1024]),
        };
        let (h, _) = req.encode(5);
        assert!(OsdRequest::decode(&h, Bytes::from(vec![0u8; 100])).is_err());
    }
}
