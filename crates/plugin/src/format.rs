//! The `.opnet` binary plugin container.
//!
//! ```text
//! magic (8B) || format_version (u32 LE) ||
//! mldsa_level (u8) || public_key || signature ||
//! metadata_len (u32 LE) || metadata_utf8 ||
//! bytecode_len (u32 LE) || bytecode ||
//! proto_len (u32 LE) || proto_schema ||
//! checksum (32B = sha256(metadata || bytecode || proto_schema))
//! ```
//!
//! Key and signature lengths are a function of the ML-DSA level byte.
//! Parsing and serialization are byte-exact inverses.

use opnet_primitives::{sha256, Buf32};

use crate::errors::PluginError;

/// Container magic.
pub const PLUGIN_MAGIC: [u8; 8] = *b"OPNETPLG";

/// Supported container format version.
pub const PLUGIN_FORMAT_VERSION: u32 = 1;

/// ML-DSA parameter-set byte and its key/signature sizes.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MlDsaLevel {
    /// ML-DSA-44.
    Level2,
    /// ML-DSA-65.
    Level3,
    /// ML-DSA-87.
    Level5,
}

impl MlDsaLevel {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            2 => Some(Self::Level2),
            3 => Some(Self::Level3),
            5 => Some(Self::Level5),
            _ => None,
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            Self::Level2 => 2,
            Self::Level3 => 3,
            Self::Level5 => 5,
        }
    }

    pub fn public_key_len(&self) -> usize {
        match self {
            Self::Level2 => 1312,
            Self::Level3 => 1952,
            Self::Level5 => 2592,
        }
    }

    pub fn signature_len(&self) -> usize {
        match self {
            Self::Level2 => 2420,
            Self::Level3 => 3309,
            Self::Level5 => 4627,
        }
    }
}

/// Post-quantum signature verification seam; the concrete ML-DSA
/// implementation lives outside this crate.
pub trait PluginSignatureVerifier: Send + Sync {
    /// Verifies `signature` over the signed content (metadata || bytecode
    /// || proto_schema) under `public_key` at the given level.
    fn verify(
        &self,
        level: MlDsaLevel,
        public_key: &[u8],
        signed_content: &[u8],
        signature: &[u8],
    ) -> bool;
}

/// A parsed plugin container.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PluginFile {
    pub format_version: u32,
    pub level: MlDsaLevel,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub metadata_utf8: String,
    pub bytecode: Vec<u8>,
    pub proto_schema: Vec<u8>,
    pub checksum: Buf32,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PluginError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| PluginError::InvalidFile("truncated".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take_u32(&mut self) -> Result<u32, PluginError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl PluginFile {
    /// Parses and structurally validates a container. Signature
    /// verification is separate so callers control the verifier.
    pub fn parse(bytes: &[u8]) -> Result<Self, PluginError> {
        let mut reader = Reader { buf: bytes, pos: 0 };

        if reader.take(8)? != PLUGIN_MAGIC {
            return Err(PluginError::InvalidFile("bad magic".into()));
        }

        let format_version = reader.take_u32()?;
        if format_version != PLUGIN_FORMAT_VERSION {
            return Err(PluginError::InvalidFile(format!(
                "unsupported format version {format_version}"
            )));
        }

        let level_byte = reader.take(1)?[0];
        let level = MlDsaLevel::from_byte(level_byte)
            .ok_or_else(|| PluginError::InvalidFile(format!("bad mldsa level {level_byte}")))?;

        let public_key = reader.take(level.public_key_len())?.to_vec();
        let signature = reader.take(level.signature_len())?.to_vec();

        let metadata_len = reader.take_u32()? as usize;
        let metadata_utf8 = std::str::from_utf8(reader.take(metadata_len)?)
            .map_err(|_| PluginError::InvalidFile("metadata is not utf-8".into()))?
            .to_string();

        let bytecode_len = reader.take_u32()? as usize;
        let bytecode = reader.take(bytecode_len)?.to_vec();

        let proto_len = reader.take_u32()? as usize;
        let proto_schema = reader.take(proto_len)?.to_vec();

        let checksum = Buf32::new(
            reader
                .take(32)?
                .try_into()
                .expect("32 bytes"),
        );

        if reader.remaining() != 0 {
            return Err(PluginError::InvalidFile("trailing bytes".into()));
        }

        let file = Self {
            format_version,
            level,
            public_key,
            signature,
            metadata_utf8,
            bytecode,
            proto_schema,
            checksum,
        };

        if file.computed_checksum() != checksum {
            return Err(PluginError::ChecksumMismatch);
        }

        Ok(file)
    }

    /// Serializes back to the exact byte layout `parse` accepts.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&PLUGIN_MAGIC);
        out.extend_from_slice(&self.format_version.to_le_bytes());
        out.push(self.level.byte());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&(self.metadata_utf8.len() as u32).to_le_bytes());
        out.extend_from_slice(self.metadata_utf8.as_bytes());
        out.extend_from_slice(&(self.bytecode.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytecode);
        out.extend_from_slice(&(self.proto_schema.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.proto_schema);
        out.extend_from_slice(self.checksum.as_ref());
        out
    }

    /// The signed and checksummed content.
    pub fn signed_content(&self) -> Vec<u8> {
        let mut content =
            Vec::with_capacity(self.metadata_utf8.len() + self.bytecode.len() + self.proto_schema.len());
        content.extend_from_slice(self.metadata_utf8.as_bytes());
        content.extend_from_slice(&self.bytecode);
        content.extend_from_slice(&self.proto_schema);
        content
    }

    pub fn computed_checksum(&self) -> Buf32 {
        sha256(&self.signed_content())
    }

    /// Verifies the embedded signature.
    pub fn verify_signature(&self, verifier: &dyn PluginSignatureVerifier) -> Result<(), PluginError> {
        if verifier.verify(
            self.level,
            &self.public_key,
            &self.signed_content(),
            &self.signature,
        ) {
            Ok(())
        } else {
            Err(PluginError::BadSignature)
        }
    }
}

/// Test/build helper: assembles a well-formed container around content.
pub fn build_plugin_file(
    level: MlDsaLevel,
    public_key: Vec<u8>,
    signature: Vec<u8>,
    metadata_utf8: String,
    bytecode: Vec<u8>,
    proto_schema: Vec<u8>,
) -> PluginFile {
    let mut file = PluginFile {
        format_version: PLUGIN_FORMAT_VERSION,
        level,
        public_key,
        signature,
        metadata_utf8,
        bytecode,
        proto_schema,
        checksum: Buf32::zero(),
    };
    file.checksum = file.computed_checksum();
    file
}
