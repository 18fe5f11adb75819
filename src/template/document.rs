//! Rendered boot documents and their transport encodings

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::error::TemplateError;
use crate::config::NodeRole;

/// Header every cloud-config document starts with
pub const CLOUD_CONFIG_HEADER: &str = "#cloud-config";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Boot configuration for exactly one node
///
/// Immutable once built. Provisioners only transport it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootDocument {
    bytes: Vec<u8>,
    role: Option<NodeRole>,
    host_index: Option<u32>,
    host: Option<String>,
    compressed: bool,
}

impl BootDocument {
    /// Wrap a rendered document, gzipping it if requested
    pub(crate) fn rendered(
        text: String,
        role: NodeRole,
        host_index: u32,
        host: String,
        compress: bool,
    ) -> Result<Self, TemplateError> {
        let bytes = if compress {
            gzip(text.as_bytes())?
        } else {
            text.into_bytes()
        };
        Ok(Self {
            bytes,
            role: Some(role),
            host_index: Some(host_index),
            host: Some(host),
            compressed: compress,
        })
    }

    /// Wrap caller-supplied bytes, detecting gzip by its magic number
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        let compressed = bytes.starts_with(&GZIP_MAGIC);
        Self {
            bytes,
            role: None,
            host_index: None,
            host: None,
            compressed,
        }
    }

    /// Attach the hostname the document is launched under
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Document bytes as transported
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the transported bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Role the document was rendered for; `None` for raw documents
    pub fn role(&self) -> Option<NodeRole> {
        self.role
    }

    /// Host index within the role; `None` for raw documents
    pub fn host_index(&self) -> Option<u32> {
        self.host_index
    }

    /// Hostname of the node, if known
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Whether the bytes are gzip encoded
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Plain document bytes
    pub fn decompressed(&self) -> Result<Vec<u8>, TemplateError> {
        if !self.compressed {
            return Ok(self.bytes.clone());
        }
        let mut out = Vec::new();
        GzDecoder::new(self.bytes.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| TemplateError::Compression(e.to_string()))?;
        Ok(out)
    }

    /// Base64 of the transported bytes (EC2 user-data encoding)
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Plain document as UTF-8 text (inflated if compressed)
    pub fn to_text(&self) -> Result<String, TemplateError> {
        String::from_utf8(self.decompressed()?)
            .map_err(|e| TemplateError::Serialization(format!("boot document is not UTF-8: {e}")))
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, TemplateError> {
    // GzEncoder writes a zero mtime, so output only depends on the input
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| TemplateError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| TemplateError::Compression(e.to_string()))
}
