//! Wire types for discovery and transfer messages.
//!
//! Every message that crosses a socket is schema-validated at the boundary
//! into one of these `serde`-derived records; downstream code must not
//! manipulate raw `serde_json::Value` maps.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version advertised in `/info` and beacon payloads.
pub const PROTOCOL_VERSION: &str = "2.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Headless,
    Mobile,
    Desktop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    Video,
    Pdf,
    Text,
    Apk,
    Other,
}

impl FileType {
    /// Infers a file type from a (possibly multi-component) relative name by
    /// case-insensitive extension match. Unknown extensions map to `Other`.
    pub fn from_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "heic" => FileType::Image,
            "mp4" | "mov" | "avi" | "mkv" | "webm" => FileType::Video,
            "pdf" => FileType::Pdf,
            "txt" | "md" | "csv" | "json" | "log" => FileType::Text,
            "apk" => FileType::Apk,
            _ => FileType::Other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

/// The inner payload of a beacon envelope (see [`BeaconEnvelope`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconPayload {
    pub alias: String,
    pub version: String,
    pub device_model: String,
    pub device_type: DeviceType,
    pub fingerprint: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub download: bool,
    #[serde(default)]
    pub announce: bool,
    pub code_hash: String,
    pub cli_session_id: Uuid,
    pub cli_mode: bool,
}

/// The envelope actually placed on the wire. `data` is the exact JSON string
/// the HMAC was computed over; receivers MUST verify the HMAC against this
/// raw string, not against a reserialization of the parsed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconEnvelope {
    pub data: String,
    pub hmac: String,
}

/// Sender/receiver identity as exchanged over HTTP (`/info`, `prepare-upload`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub alias: String,
    pub version: String,
    pub device_model: String,
    pub device_type: DeviceType,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default)]
    pub download: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliAuth {
    pub timestamp: String,
    pub proof: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadRequest {
    pub info: DeviceInfo,
    #[serde(default)]
    pub files: HashMap<String, FileDescriptor>,
    /// Absent when a peer omits authentication entirely; the handler maps
    /// that to 401, same as an expired timestamp or proof mismatch, rather
    /// than failing JSON deserialization with a generic 400.
    #[serde(default)]
    pub cli_auth: Option<CliAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareUploadResponse {
    pub session_id: Uuid,
    pub files: HashMap<Uuid, FileDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub alias: String,
    pub version: String,
    pub device_model: String,
    pub device_type: DeviceType,
    pub fingerprint: String,
    pub download: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub session_id: Uuid,
    pub file_id: Uuid,
}
