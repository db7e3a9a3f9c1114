//! Small keyed store of system blobs.
//!
//! Holds the credential payload and the device identity strings. The
//! transport reads them independently of the attempt logic.

use std::collections::BTreeMap;

/// Auth blob slot holding the root refresh-token grant.
pub const AUTH_IDX_ROOT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlobKind {
    Auth(u8),
    DeviceSerial,
    DeviceFwVersion,
    DeviceType,
}

#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    blobs: BTreeMap<BlobKind, Vec<u8>>,
}

impl BlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the blob's content.
    pub fn direct_set(&mut self, kind: BlobKind, data: &[u8]) {
        self.blobs.insert(kind, data.to_vec());
    }

    /// Appends to the blob, creating it if needed.
    pub fn heap_append(&mut self, kind: BlobKind, data: &[u8]) {
        self.blobs.entry(kind).or_default().extend_from_slice(data);
    }

    pub fn heap_empty(&mut self, kind: BlobKind) {
        self.blobs.remove(&kind);
    }

    #[must_use]
    pub fn size(&self, kind: BlobKind) -> usize {
        self.blobs.get(&kind).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn get(&self, kind: BlobKind) -> Option<&[u8]> {
        self.blobs.get(&kind).map(Vec::as_slice)
    }

    fn get_str(&self, kind: BlobKind) -> Option<&str> {
        self.get(kind).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Seeds the device identity every instance advertises.
    pub fn seed_device_identity(&mut self) {
        self.direct_set(BlobKind::DeviceSerial, b"SN12345678");
        self.direct_set(BlobKind::DeviceFwVersion, b"v0.01");
        self.heap_append(BlobKind::DeviceType, b"spacerocket");
    }

    /// `User-Agent` built from the device identity blobs.
    #[must_use]
    pub fn user_agent(&self) -> String {
        let field = |kind| self.get_str(kind).unwrap_or("unknown");
        format!(
            "sstress/{} ({}; {}; {})",
            env!("CARGO_PKG_VERSION"),
            field(BlobKind::DeviceType),
            field(BlobKind::DeviceSerial),
            field(BlobKind::DeviceFwVersion),
        )
    }

    /// The `refresh_token` field of the root auth grant, if one is stored.
    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.get_str(BlobKind::Auth(AUTH_IDX_ROOT))?
            .split('&')
            .find_map(|pair| pair.strip_prefix("refresh_token="))
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
    }
}
